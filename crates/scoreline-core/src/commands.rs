use std::{fmt, path::PathBuf};

use rosc::{OscBundle, OscMessage, OscPacket, OscTime, OscType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    compiler::CompileError,
    model::{AddAction, AudioSource, GenerateCommand, HeaderFormat, SampleFormat},
};

/// Identity of an audio source that has to be rendered before use.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderKey {
    Session(Uuid),
    Renderable(String),
}

impl fmt::Display for RenderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Renderable(key) => write!(f, "renderable:{key}"),
        }
    }
}

/// A path argument, either known now or produced by an upstream render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Path(PathBuf),
    Rendered(RenderKey),
}

impl FileSource {
    #[must_use]
    pub fn from_source(source: &AudioSource) -> Self {
        match source {
            AudioSource::File(path) => Self::Path(path.clone()),
            AudioSource::Session(session) => Self::Rendered(RenderKey::Session(session.id())),
            AudioSource::Renderable(renderable) => {
                Self::Rendered(RenderKey::Renderable(renderable.render_key()))
            }
        }
    }

    fn resolve(&self, resolver: &Resolver<'_>) -> Result<OscType, CompileError> {
        let path = match self {
            Self::Path(path) => path.clone(),
            Self::Rendered(key) => {
                resolver(key).ok_or_else(|| CompileError::UnresolvedSource(key.clone()))?
            }
        };
        Ok(OscType::String(path.display().to_string()))
    }
}

/// Maps rendered dependencies to the files they were rendered to.
pub type Resolver<'a> = dyn Fn(&RenderKey) -> Option<PathBuf> + 'a;

/// Resolver for sessions without rendered dependencies.
#[must_use]
pub fn no_dependencies(_: &RenderKey) -> Option<PathBuf> {
    None
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlValue {
    Float(f64),
    Int(i32),
    Symbol(String),
}

impl ControlValue {
    fn to_osc(&self) -> OscType {
        match self {
            Self::Float(value) => OscType::Float(*value as f32),
            Self::Int(value) => OscType::Int(*value),
            Self::Symbol(value) => OscType::String(value.clone()),
        }
    }
}

/// One engine command, with entity ids already mapped to engine integers.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    SynthDefReceive {
        name: String,
        compiled: Vec<u8>,
    },
    BufferAllocate {
        buffer: i32,
        frame_count: i32,
        channel_count: i32,
    },
    BufferAllocateRead {
        buffer: i32,
        path: FileSource,
        starting_frame: i32,
        frame_count: i32,
        channels: Option<Vec<i32>>,
    },
    BufferRead {
        buffer: i32,
        path: FileSource,
        starting_frame_in_file: i32,
        frame_count: i32,
        starting_frame_in_buffer: i32,
        leave_open: bool,
        channels: Option<Vec<i32>>,
    },
    BufferZero {
        buffer: i32,
    },
    BufferFill {
        buffer: i32,
        ranges: Vec<(i32, i32, f64)>,
    },
    BufferGenerate {
        buffer: i32,
        command: GenerateCommand,
        flags: i32,
        coefficients: Vec<f64>,
    },
    BufferSet {
        buffer: i32,
        values: Vec<(i32, f64)>,
    },
    BufferSetContiguous {
        buffer: i32,
        runs: Vec<(i32, Vec<f64>)>,
    },
    BufferNormalize {
        buffer: i32,
        new_maximum: f64,
        as_wavetable: bool,
    },
    BufferCopy {
        source: i32,
        target: i32,
        source_starting_frame: i32,
        target_starting_frame: i32,
        frame_count: i32,
    },
    BufferWrite {
        buffer: i32,
        path: PathBuf,
        header_format: HeaderFormat,
        sample_format: SampleFormat,
        frame_count: i32,
        starting_frame: i32,
        leave_open: bool,
    },
    BufferClose {
        buffer: i32,
    },
    BufferFree {
        buffer: i32,
    },
    SynthNew {
        synthdef: String,
        node: i32,
        add_action: AddAction,
        target: i32,
        controls: Vec<(String, ControlValue)>,
    },
    GroupNew {
        node: i32,
        add_action: AddAction,
        target: i32,
    },
    NodeMove {
        node: i32,
        add_action: AddAction,
        target: i32,
    },
    ControlBusSet {
        values: Vec<(i32, f64)>,
    },
    NodeSet {
        node: i32,
        controls: Vec<(String, ControlValue)>,
    },
    NodeMapToControlBus {
        node: i32,
        mappings: Vec<(String, i32)>,
    },
    NodeMapToAudioBus {
        node: i32,
        mappings: Vec<(String, i32)>,
    },
    NodeFree {
        nodes: Vec<i32>,
    },
}

impl Request {
    /// Closes every compiled score; harmless for the engine to execute.
    #[must_use]
    pub fn terminator() -> Self {
        Self::ControlBusSet {
            values: vec![(0, 0.0)],
        }
    }

    #[must_use]
    pub fn address(&self) -> &'static str {
        match self {
            Self::SynthDefReceive { .. } => "/d_recv",
            Self::BufferAllocate { .. } => "/b_alloc",
            Self::BufferAllocateRead { channels: None, .. } => "/b_allocRead",
            Self::BufferAllocateRead { .. } => "/b_allocReadChannel",
            Self::BufferRead { channels: None, .. } => "/b_read",
            Self::BufferRead { .. } => "/b_readChannel",
            Self::BufferZero { .. } => "/b_zero",
            Self::BufferFill { .. } => "/b_fill",
            Self::BufferGenerate { .. }
            | Self::BufferNormalize { .. }
            | Self::BufferCopy { .. } => "/b_gen",
            Self::BufferSet { .. } => "/b_set",
            Self::BufferSetContiguous { .. } => "/b_setn",
            Self::BufferWrite { .. } => "/b_write",
            Self::BufferClose { .. } => "/b_close",
            Self::BufferFree { .. } => "/b_free",
            Self::SynthNew { .. } => "/s_new",
            Self::GroupNew { .. } => "/g_new",
            Self::NodeMove { add_action, .. } => match add_action {
                AddAction::AddToHead => "/g_head",
                AddAction::AddToTail => "/g_tail",
                AddAction::AddBefore => "/n_before",
                AddAction::AddAfter => "/n_after",
            },
            Self::ControlBusSet { .. } => "/c_set",
            Self::NodeSet { .. } => "/n_set",
            Self::NodeMapToControlBus { .. } => "/n_map",
            Self::NodeMapToAudioBus { .. } => "/n_mapa",
            Self::NodeFree { .. } => "/n_free",
        }
    }

    pub fn to_message(&self, resolver: &Resolver<'_>) -> Result<OscMessage, CompileError> {
        let args = match self {
            Self::SynthDefReceive { compiled, .. } => vec![OscType::Blob(compiled.clone())],
            Self::BufferAllocate {
                buffer,
                frame_count,
                channel_count,
            } => ints(&[*buffer, *frame_count, *channel_count]),
            Self::BufferAllocateRead {
                buffer,
                path,
                starting_frame,
                frame_count,
                channels,
            } => {
                let mut args = vec![
                    OscType::Int(*buffer),
                    path.resolve(resolver)?,
                    OscType::Int(*starting_frame),
                    OscType::Int(*frame_count),
                ];
                args.extend(channels.iter().flatten().copied().map(OscType::Int));
                args
            }
            Self::BufferRead {
                buffer,
                path,
                starting_frame_in_file,
                frame_count,
                starting_frame_in_buffer,
                leave_open,
                channels,
            } => {
                let mut args = vec![
                    OscType::Int(*buffer),
                    path.resolve(resolver)?,
                    OscType::Int(*starting_frame_in_file),
                    OscType::Int(*frame_count),
                    OscType::Int(*starting_frame_in_buffer),
                    OscType::Int(i32::from(*leave_open)),
                ];
                args.extend(channels.iter().flatten().copied().map(OscType::Int));
                args
            }
            Self::BufferZero { buffer }
            | Self::BufferClose { buffer }
            | Self::BufferFree { buffer } => ints(&[*buffer]),
            Self::BufferFill { buffer, ranges } => {
                let mut args = vec![OscType::Int(*buffer)];
                for (start, count, value) in ranges {
                    args.extend([OscType::Int(*start), OscType::Int(*count), float(*value)]);
                }
                args
            }
            Self::BufferGenerate {
                buffer,
                command,
                flags,
                coefficients,
            } => {
                let mut args = vec![
                    OscType::Int(*buffer),
                    OscType::String(command.name().to_string()),
                    OscType::Int(*flags),
                ];
                args.extend(coefficients.iter().copied().map(float));
                args
            }
            Self::BufferSet { buffer, values } => {
                let mut args = vec![OscType::Int(*buffer)];
                for (index, value) in values {
                    args.extend([OscType::Int(*index), float(*value)]);
                }
                args
            }
            Self::BufferSetContiguous { buffer, runs } => {
                let mut args = vec![OscType::Int(*buffer)];
                for (start, values) in runs {
                    args.push(OscType::Int(*start));
                    args.push(OscType::Int(length(values.len())?));
                    args.extend(values.iter().copied().map(float));
                }
                args
            }
            Self::BufferNormalize {
                buffer,
                new_maximum,
                as_wavetable,
            } => {
                let command = if *as_wavetable { "wnormalize" } else { "normalize" };
                vec![
                    OscType::Int(*buffer),
                    OscType::String(command.to_string()),
                    float(*new_maximum),
                ]
            }
            Self::BufferCopy {
                source,
                target,
                source_starting_frame,
                target_starting_frame,
                frame_count,
            } => vec![
                OscType::Int(*target),
                OscType::String("copy".to_string()),
                OscType::Int(*target_starting_frame),
                OscType::Int(*source),
                OscType::Int(*source_starting_frame),
                OscType::Int(*frame_count),
            ],
            Self::BufferWrite {
                buffer,
                path,
                header_format,
                sample_format,
                frame_count,
                starting_frame,
                leave_open,
            } => vec![
                OscType::Int(*buffer),
                OscType::String(path.display().to_string()),
                OscType::String(header_format.name().to_string()),
                OscType::String(sample_format.name().to_string()),
                OscType::Int(*frame_count),
                OscType::Int(*starting_frame),
                OscType::Int(i32::from(*leave_open)),
            ],
            Self::SynthNew {
                synthdef,
                node,
                add_action,
                target,
                controls,
            } => {
                let mut args = vec![
                    OscType::String(synthdef.clone()),
                    OscType::Int(*node),
                    OscType::Int(add_action.code()),
                    OscType::Int(*target),
                ];
                args.extend(control_pairs(controls));
                args
            }
            Self::GroupNew {
                node,
                add_action,
                target,
            } => ints(&[*node, add_action.code(), *target]),
            // group-relative moves name the group first
            Self::NodeMove {
                node,
                add_action,
                target,
            } => match add_action {
                AddAction::AddToHead | AddAction::AddToTail => ints(&[*target, *node]),
                AddAction::AddBefore | AddAction::AddAfter => ints(&[*node, *target]),
            },
            Self::ControlBusSet { values } => values
                .iter()
                .flat_map(|(bus, value)| [OscType::Int(*bus), float(*value)])
                .collect(),
            Self::NodeSet { node, controls } => {
                let mut args = vec![OscType::Int(*node)];
                args.extend(control_pairs(controls));
                args
            }
            Self::NodeMapToControlBus { node, mappings }
            | Self::NodeMapToAudioBus { node, mappings } => {
                let mut args = vec![OscType::Int(*node)];
                for (name, bus) in mappings {
                    args.extend([OscType::String(name.clone()), OscType::Int(*bus)]);
                }
                args
            }
            Self::NodeFree { nodes } => ints(nodes),
        };
        Ok(OscMessage {
            addr: self.address().to_string(),
            args,
        })
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let placeholder = |key: &RenderKey| Some(PathBuf::from(format!("<{key}>")));
        let Ok(message) = self.to_message(&placeholder) else {
            return write!(f, "{}", self.address());
        };
        write!(f, "{}", message.addr)?;
        for arg in &message.args {
            match arg {
                OscType::Int(value) => write!(f, " {value}")?,
                OscType::Float(value) => write!(f, " {value:?}")?,
                OscType::String(value) => write!(f, " {value:?}")?,
                OscType::Blob(bytes) => write!(f, " <{} bytes>", bytes.len())?,
                other => write!(f, " {other:?}")?,
            }
        }
        Ok(())
    }
}

fn ints(values: &[i32]) -> Vec<OscType> {
    values.iter().copied().map(OscType::Int).collect()
}

fn float(value: f64) -> OscType {
    OscType::Float(value as f32)
}

fn length(len: usize) -> Result<i32, CompileError> {
    i32::try_from(len).map_err(|_| CompileError::Exhausted("sample run length"))
}

fn control_pairs(controls: &[(String, ControlValue)]) -> impl Iterator<Item = OscType> + '_ {
    controls
        .iter()
        .flat_map(|(name, value)| [OscType::String(name.clone()), value.to_osc()])
}

/// Requests sharing one timestamp, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestBundle {
    pub timestamp: f64,
    pub requests: Vec<Request>,
}

impl RequestBundle {
    #[must_use]
    pub fn new(timestamp: f64, requests: Vec<Request>) -> Self {
        Self {
            timestamp,
            requests,
        }
    }

    pub fn to_osc(&self, resolver: &Resolver<'_>) -> Result<OscBundle, CompileError> {
        let content = self
            .requests
            .iter()
            .map(|request| request.to_message(resolver).map(OscPacket::Message))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(OscBundle {
            timetag: timetag(self.timestamp),
            content,
        })
    }
}

/// Non-realtime timetags count seconds from the start of the score.
#[must_use]
pub fn timetag(seconds: f64) -> OscTime {
    let seconds = seconds.max(0.0);
    let whole = seconds.floor();
    OscTime {
        seconds: whole as u32,
        fractional: ((seconds - whole) * 4_294_967_296.0) as u32,
    }
}

/// Serializes bundles into the engine's score file framing: each bundle
/// prefixed with its big-endian byte length.
pub fn encode_datagram(
    bundles: &[RequestBundle],
    resolver: &Resolver<'_>,
) -> Result<Vec<u8>, CompileError> {
    let mut datagram = Vec::new();
    for bundle in bundles {
        let packet = OscPacket::Bundle(bundle.to_osc(resolver)?);
        let bytes = rosc::encoder::encode(&packet)
            .map_err(|error| CompileError::Encode(format!("{error:?}")))?;
        let size =
            u32::try_from(bytes.len()).map_err(|_| CompileError::Exhausted("bundle size"))?;
        datagram.extend_from_slice(&size.to_be_bytes());
        datagram.extend_from_slice(&bytes);
    }
    Ok(datagram)
}

/// Splits a score file back into its bundles.
pub fn decode_datagram(datagram: &[u8]) -> Result<Vec<OscBundle>, CompileError> {
    let mut bundles = Vec::new();
    let mut rest = datagram;
    while !rest.is_empty() {
        let (bundle_bytes, remainder) = take_sized(rest, "bundle")?;
        bundles.push(decode_bundle(bundle_bytes)?);
        rest = remainder;
    }
    Ok(bundles)
}

const BUNDLE_TAG: &[u8; 8] = b"#bundle\0";

/// Reads one bundle element by element, so every size prefix is honoured.
fn decode_bundle(bytes: &[u8]) -> Result<OscBundle, CompileError> {
    let body = bytes
        .strip_prefix(BUNDLE_TAG)
        .ok_or_else(|| CompileError::Decode("expected a bundle".to_string()))?;
    let (seconds, body) = take_u32(body, "timetag")?;
    let (fractional, mut body) = take_u32(body, "timetag")?;
    let mut content = Vec::new();
    while !body.is_empty() {
        let (element, remainder) = take_sized(body, "bundle element")?;
        content.push(decode_element(element)?);
        body = remainder;
    }
    Ok(OscBundle {
        timetag: OscTime {
            seconds,
            fractional,
        },
        content,
    })
}

fn decode_element(bytes: &[u8]) -> Result<OscPacket, CompileError> {
    if bytes.starts_with(BUNDLE_TAG) {
        return decode_bundle(bytes).map(OscPacket::Bundle);
    }
    let (leftover, packet) = rosc::decoder::decode_udp(bytes)
        .map_err(|error| CompileError::Decode(format!("{error:?}")))?;
    if !leftover.is_empty() {
        return Err(CompileError::Decode(format!(
            "{} trailing bytes after message",
            leftover.len()
        )));
    }
    Ok(packet)
}

fn take_u32<'a>(bytes: &'a [u8], what: &str) -> Result<(u32, &'a [u8]), CompileError> {
    let (head, rest) = bytes
        .split_first_chunk::<4>()
        .ok_or_else(|| CompileError::Decode(format!("truncated {what}")))?;
    Ok((u32::from_be_bytes(*head), rest))
}

/// Splits off a big-endian size prefix and the payload it announces.
fn take_sized<'a>(bytes: &'a [u8], what: &str) -> Result<(&'a [u8], &'a [u8]), CompileError> {
    let (size, rest) = take_u32(bytes, what)?;
    let size = size as usize;
    if rest.len() < size {
        return Err(CompileError::Decode(format!("truncated {what}")));
    }
    Ok(rest.split_at(size))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_moves_put_the_group_first() {
        let head = Request::NodeMove {
            node: 1001,
            add_action: AddAction::AddToHead,
            target: 1000,
        };
        let message = head.to_message(&no_dependencies).expect("message should build");
        assert_eq!(message.addr, "/g_head");
        assert_eq!(message.args, vec![OscType::Int(1000), OscType::Int(1001)]);

        let after = Request::NodeMove {
            node: 1001,
            add_action: AddAction::AddAfter,
            target: 1000,
        };
        let message = after.to_message(&no_dependencies).expect("message should build");
        assert_eq!(message.addr, "/n_after");
        assert_eq!(message.args, vec![OscType::Int(1001), OscType::Int(1000)]);
    }

    #[test]
    fn rendered_sources_need_a_resolution() {
        let key = RenderKey::Renderable("tone".to_string());
        let read = Request::BufferAllocateRead {
            buffer: 0,
            path: FileSource::Rendered(key.clone()),
            starting_frame: 0,
            frame_count: 0,
            channels: None,
        };
        assert!(matches!(
            read.to_message(&no_dependencies),
            Err(CompileError::UnresolvedSource(_))
        ));
        let resolved = read
            .to_message(&|_: &RenderKey| Some(PathBuf::from("/tmp/tone.aiff")))
            .expect("resolved read should build");
        assert_eq!(resolved.args[1], OscType::String("/tmp/tone.aiff".to_string()));
    }

    #[test]
    fn timetags_carry_fractional_seconds() {
        let tag = timetag(1.5);
        assert_eq!(tag.seconds, 1);
        assert_eq!(tag.fractional, 1 << 31);
    }

    #[test]
    fn datagrams_frame_each_bundle() {
        let bundles = vec![
            RequestBundle::new(0.0, vec![Request::NodeFree { nodes: vec![1000] }]),
            RequestBundle::new(2.0, vec![Request::terminator()]),
        ];
        let datagram = encode_datagram(&bundles, &no_dependencies).expect("encode should succeed");
        let size = u32::from_be_bytes([datagram[0], datagram[1], datagram[2], datagram[3]]);
        assert_eq!(&datagram[4..12], b"#bundle\0");
        assert!(datagram.len() > size as usize + 4);

        let decoded = decode_datagram(&datagram).expect("decode should succeed");
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].timetag.seconds, 2);
    }

    #[test]
    fn blob_messages_survive_decoding_with_their_neighbours() {
        let bundles = vec![RequestBundle::new(
            1.0,
            vec![
                Request::SynthDefReceive {
                    name: "sine".to_string(),
                    compiled: vec![7; 12],
                },
                Request::NodeFree { nodes: vec![1000] },
            ],
        )];
        let datagram = encode_datagram(&bundles, &no_dependencies).expect("encode should succeed");
        let decoded = decode_datagram(&datagram).expect("decode should succeed");

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].timetag.seconds, 1);
        let addresses: Vec<&str> = decoded[0]
            .content
            .iter()
            .filter_map(|packet| match packet {
                OscPacket::Message(message) => Some(message.addr.as_str()),
                OscPacket::Bundle(_) => None,
            })
            .collect();
        assert_eq!(addresses, vec!["/d_recv", "/n_free"]);
        let OscPacket::Message(receive) = &decoded[0].content[0] else {
            panic!("expected the synthdef message first");
        };
        assert_eq!(receive.args, vec![OscType::Blob(vec![7; 12])]);
    }

    #[test]
    fn stray_bytes_after_a_bundle_are_rejected() {
        let bundles = vec![RequestBundle::new(0.0, vec![Request::terminator()])];
        let mut datagram =
            encode_datagram(&bundles, &no_dependencies).expect("encode should succeed");
        datagram.extend_from_slice(&[0, 0, 0, 2, 1, 2]);
        assert!(matches!(
            decode_datagram(&datagram),
            Err(CompileError::Decode(_))
        ));
    }

    #[test]
    fn display_lists_address_and_arguments() {
        let request = Request::SynthNew {
            synthdef: "sine".to_string(),
            node: 1000,
            add_action: AddAction::AddToHead,
            target: 0,
            controls: vec![("frequency".to_string(), ControlValue::Float(440.0))],
        };
        assert_eq!(
            request.to_string(),
            "/s_new \"sine\" 1000 0 0 \"frequency\" 440.0"
        );
    }
}
