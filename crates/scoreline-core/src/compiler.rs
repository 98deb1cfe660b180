use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::{
    commands::{ControlValue, FileSource, RenderKey, Request, RequestBundle},
    ids::IdMapping,
    model::{
        Buffer, BufferEvent, BufferEventKind, BufferId, CalculationRate, Node, NodeId, NodeKind,
        ParamValue, Parameter, ParameterRate,
    },
    session::Session,
    state::State,
    time::Offset,
    transition::NodeAction,
};

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compile duration must be finite and positive, got {0}")]
    InvalidDuration(f64),
    #[error("session never ends; pass an explicit duration")]
    DurationRequired,
    #[error("{0} has no engine id")]
    Unmapped(String),
    #[error("ran out of {0} ids")]
    Exhausted(&'static str),
    #[error("audio source {0} has not been rendered")]
    UnresolvedSource(RenderKey),
    #[error("osc encoding failed: {0}")]
    Encode(String),
    #[error("malformed score datagram: {0}")]
    Decode(String),
}

/// Compiles `session` into timestamped request bundles.
///
/// `duration` defaults to [`Session::duration`]; a session with nodes or
/// buffers that never stop needs an explicit one.
#[instrument(skip(session), fields(session_id = %session.id()))]
pub fn compile(
    session: &Session,
    duration: Option<f64>,
) -> Result<Vec<RequestBundle>, CompileError> {
    let end = compile_end(session, duration)?;
    let mapping = IdMapping::build(session)?;
    let mut context = Compilation {
        session,
        mapping,
        end,
        open_buffers: BTreeSet::new(),
        uploaded: BTreeSet::new(),
    };
    let mut bundles = Vec::new();
    for offset in compile_offsets(session, end) {
        let mut requests = context.requests_at(offset)?;
        if offset == end {
            requests.push(Request::terminator());
        }
        if !requests.is_empty() {
            bundles.push(RequestBundle::new(offset.seconds(), requests));
        }
    }
    debug!(bundles = bundles.len(), end = %end, "session compiled");
    Ok(bundles)
}

impl Session {
    pub fn to_request_bundles(
        &self,
        duration: Option<f64>,
    ) -> Result<Vec<RequestBundle>, CompileError> {
        compile(self, duration)
    }
}

/// The score ends at the requested duration, or earlier when everything
/// has already stopped by the last finite offset.
fn compile_end(session: &Session, duration: Option<f64>) -> Result<Offset, CompileError> {
    let requested = match duration {
        Some(duration) => duration,
        None if session.is_open_ended() => return Err(CompileError::DurationRequired),
        None => session.duration(),
    };
    if !requested.is_finite() || requested <= 0.0 {
        return Err(CompileError::InvalidDuration(requested));
    }
    if !session.is_open_ended() {
        let natural = session.duration();
        if natural > 0.0 && natural < requested {
            return Ok(Offset::from(natural));
        }
    }
    Ok(Offset::from(requested))
}

fn compile_offsets(session: &Session, end: Offset) -> BTreeSet<Offset> {
    let node_events = session
        .nodes()
        .flat_map(|node| node.events().values().flat_map(|events| events.offsets()));
    let bus_events = session.buses().flat_map(|bus| bus.events().offsets());
    let buffer_events = session
        .buffers()
        .flat_map(|buffer| buffer.events().values().flat_map(|events| events.offsets()));
    session
        .offsets()
        .into_iter()
        .chain(node_events)
        .chain(bus_events)
        .chain(buffer_events)
        .filter(|offset| Offset::ZERO <= *offset && *offset <= end)
        .chain(std::iter::once(end))
        .collect()
}

struct Compilation<'a> {
    session: &'a Session,
    mapping: IdMapping,
    end: Offset,
    open_buffers: BTreeSet<BufferId>,
    uploaded: BTreeSet<String>,
}

impl Compilation<'_> {
    fn requests_at(&mut self, offset: Offset) -> Result<Vec<Request>, CompileError> {
        let session = self.session;
        let empty;
        let state = match session.state_at(offset) {
            Some(state) => state,
            None => {
                empty = State::new(offset);
                &empty
            }
        };
        let mut stop_nodes: BTreeSet<NodeId> = state.stop_nodes().clone();
        let mut stop_buffers: BTreeSet<BufferId> = state.stop_buffers().clone();
        if offset == self.end {
            stop_nodes.extend(
                session
                    .nodes_at(offset)
                    .into_iter()
                    .filter(|node| session.node(*node).is_some_and(|node| node.start() < offset)),
            );
            stop_buffers.extend(
                session
                    .buffers_at(offset)
                    .into_iter()
                    .filter(|buffer| {
                        session
                            .buffer(*buffer)
                            .is_some_and(|buffer| buffer.start() < offset)
                    }),
            );
        }

        let mut requests = Vec::new();
        self.synthdef_uploads(state, &mut requests);
        self.buffer_allocations(state, &mut requests)?;
        self.buffer_events(offset, false, &mut requests)?;
        let mut settings = self.node_settings(offset);
        self.node_actions(state, &mut settings, &mut requests)?;
        self.bus_sets(offset, &mut requests)?;
        self.node_sets(settings, &mut requests)?;
        self.node_frees(&stop_nodes, &mut requests)?;
        self.buffer_events(offset, true, &mut requests)?;
        self.buffer_frees(&stop_buffers, &mut requests)?;
        Ok(requests)
    }

    fn node(&self, id: NodeId) -> Option<&'_ Node> {
        self.session.node(id)
    }

    fn synthdef_uploads(&mut self, state: &State, requests: &mut Vec<Request>) {
        let mut fresh = BTreeMap::new();
        for node in state.start_nodes() {
            if let Some(synthdef) = self.session.node(*node).and_then(Node::synthdef) {
                if !self.uploaded.contains(synthdef.name()) {
                    fresh.insert(synthdef.name().to_string(), synthdef.compiled().to_vec());
                }
            }
        }
        for (name, compiled) in fresh {
            self.uploaded.insert(name.clone());
            requests.push(Request::SynthDefReceive { name, compiled });
        }
    }

    fn buffer_allocations(
        &mut self,
        state: &State,
        requests: &mut Vec<Request>,
    ) -> Result<(), CompileError> {
        for id in state.start_buffers() {
            let Some(buffer) = self.session.buffer(*id) else {
                continue;
            };
            let index = self.mapping.buffer(*id)?;
            let request = match (buffer.source(), buffer.channel_count()) {
                (None, channels) => Request::BufferAllocate {
                    buffer: index,
                    frame_count: count(buffer.frame_count().unwrap_or(1))?,
                    channel_count: count(channels.unwrap_or(1))?,
                },
                (Some(source), channels) => Request::BufferAllocateRead {
                    buffer: index,
                    path: FileSource::from_source(source),
                    starting_frame: count(buffer.starting_frame())?,
                    frame_count: count(buffer.frame_count().unwrap_or(0))?,
                    channels: channels
                        .map(|channels| (0..channels).map(count).collect::<Result<Vec<_>, _>>())
                        .transpose()?,
                },
            };
            requests.push(request);
        }
        Ok(())
    }

    /// Buffer commands recorded exactly at `offset`, either the
    /// post-allocation group or the pre-free group.
    fn buffer_events(
        &mut self,
        offset: Offset,
        pre_free: bool,
        requests: &mut Vec<Request>,
    ) -> Result<(), CompileError> {
        let session = self.session;
        let mut pending: BTreeMap<BufferEventKind, Vec<(i32, &Buffer, &BufferEvent)>> =
            BTreeMap::new();
        for buffer in session.buffers() {
            for (kind, events) in buffer.events() {
                if kind.is_pre_free() != pre_free {
                    continue;
                }
                if let Some(event) = events.at(offset) {
                    let index = self.mapping.buffer(buffer.id())?;
                    pending.entry(*kind).or_default().push((index, buffer, event));
                }
            }
        }
        for (_, mut events) in pending {
            events.sort_by_key(|(index, _, _)| *index);
            for (index, buffer, event) in events {
                self.buffer_event(index, buffer.id(), event, requests)?;
            }
        }
        Ok(())
    }

    fn buffer_event(
        &mut self,
        index: i32,
        id: BufferId,
        event: &BufferEvent,
        requests: &mut Vec<Request>,
    ) -> Result<(), CompileError> {
        let request = match event {
            BufferEvent::Read {
                source,
                channels,
                frame_count,
                starting_frame_in_buffer,
                starting_frame_in_file,
                leave_open,
            } => {
                self.close_if_open(index, id, requests);
                if *leave_open {
                    self.open_buffers.insert(id);
                }
                Request::BufferRead {
                    buffer: index,
                    path: FileSource::from_source(source),
                    starting_frame_in_file: count(*starting_frame_in_file)?,
                    frame_count: frame_count.map_or(Ok(-1), count)?,
                    starting_frame_in_buffer: count(*starting_frame_in_buffer)?,
                    leave_open: *leave_open,
                    channels: channels
                        .as_ref()
                        .map(|channels| {
                            channels
                                .iter()
                                .copied()
                                .map(count)
                                .collect::<Result<Vec<_>, _>>()
                        })
                        .transpose()?,
                }
            }
            BufferEvent::Zero => Request::BufferZero { buffer: index },
            BufferEvent::Fill(ranges) => Request::BufferFill {
                buffer: index,
                ranges: ranges
                    .iter()
                    .map(|(start, frames, value)| Ok((count(*start)?, count(*frames)?, *value)))
                    .collect::<Result<Vec<_>, CompileError>>()?,
            },
            BufferEvent::Generate(generate) => Request::BufferGenerate {
                buffer: index,
                command: generate.command,
                flags: generate.flags.bits(),
                coefficients: generate.coefficients(),
            },
            BufferEvent::Set(values) => Request::BufferSet {
                buffer: index,
                values: values
                    .iter()
                    .map(|(at, value)| Ok((count(*at)?, *value)))
                    .collect::<Result<Vec<_>, CompileError>>()?,
            },
            BufferEvent::SetContiguous(runs) => Request::BufferSetContiguous {
                buffer: index,
                runs: runs
                    .iter()
                    .map(|(start, values)| Ok((count(*start)?, values.clone())))
                    .collect::<Result<Vec<_>, CompileError>>()?,
            },
            BufferEvent::Normalize {
                new_maximum,
                as_wavetable,
            } => Request::BufferNormalize {
                buffer: index,
                new_maximum: *new_maximum,
                as_wavetable: *as_wavetable,
            },
            BufferEvent::Copy {
                target,
                source_starting_frame,
                target_starting_frame,
                frame_count,
            } => Request::BufferCopy {
                source: index,
                target: self.mapping.buffer(*target)?,
                source_starting_frame: count(*source_starting_frame)?,
                target_starting_frame: count(*target_starting_frame)?,
                frame_count: frame_count.map_or(Ok(-1), count)?,
            },
            BufferEvent::Write {
                path,
                header_format,
                sample_format,
                frame_count,
                starting_frame,
                leave_open,
            } => {
                self.close_if_open(index, id, requests);
                if *leave_open {
                    self.open_buffers.insert(id);
                }
                Request::BufferWrite {
                    buffer: index,
                    path: path.clone(),
                    header_format: *header_format,
                    sample_format: *sample_format,
                    frame_count: frame_count.map_or(Ok(-1), count)?,
                    starting_frame: count(*starting_frame)?,
                    leave_open: *leave_open,
                }
            }
            BufferEvent::Close => {
                self.close_if_open(index, id, requests);
                return Ok(());
            }
        };
        requests.push(request);
        Ok(())
    }

    fn close_if_open(&mut self, index: i32, id: BufferId, requests: &mut Vec<Request>) {
        if self.open_buffers.remove(&id) {
            requests.push(Request::BufferClose { buffer: index });
        }
    }

    /// Parameter values recorded exactly at `offset`, per node in tree order.
    fn node_settings(&self, offset: Offset) -> Vec<(NodeId, BTreeMap<String, ParamValue>)> {
        let tree = self.session.tree_at(offset);
        tree.preorder(NodeId::ROOT)
            .into_iter()
            .filter_map(|id| {
                let node = self.node(id)?;
                let settings: BTreeMap<String, ParamValue> = node
                    .events()
                    .iter()
                    .filter_map(|(name, events)| {
                        events.at(offset).map(|value| (name.clone(), *value))
                    })
                    .collect();
                (!settings.is_empty()).then_some((id, settings))
            })
            .collect()
    }

    fn node_actions(
        &self,
        state: &State,
        settings: &mut Vec<(NodeId, BTreeMap<String, ParamValue>)>,
        requests: &mut Vec<Request>,
    ) -> Result<(), CompileError> {
        for transition in state.transitions() {
            let source = transition.source;
            let NodeAction::Add { action, target } = transition.action else {
                requests.push(Request::NodeFree {
                    nodes: vec![self.mapping.node(source)?],
                });
                continue;
            };
            let node_index = self.mapping.node(source)?;
            let target_index = self.mapping.node(target)?;
            if !state.start_nodes().contains(&source) {
                requests.push(Request::NodeMove {
                    node: node_index,
                    add_action: action,
                    target: target_index,
                });
                continue;
            }
            let Some(node) = self.node(source) else {
                continue;
            };
            match node.kind() {
                NodeKind::Group => requests.push(Request::GroupNew {
                    node: node_index,
                    add_action: action,
                    target: target_index,
                }),
                NodeKind::Synth { synthdef, kwargs } => {
                    let mut values = kwargs.clone();
                    if let Some(position) = settings.iter().position(|(id, _)| *id == source) {
                        values.extend(settings.remove(position).1);
                    }
                    let mut controls = values
                        .into_iter()
                        .map(|(name, value)| {
                            let control = self.control_value(value, synthdef.parameter(&name))?;
                            Ok((name, control))
                        })
                        .collect::<Result<Vec<_>, CompileError>>()?;
                    if synthdef.has_parameter("duration") {
                        let stop = if self.end < node.stop() { self.end } else { node.stop() };
                        let duration = ControlValue::Float(stop - node.start());
                        controls.retain(|(name, _)| name != "duration");
                        controls.push(("duration".to_string(), duration));
                        controls.sort_by(|(one, _), (two, _)| one.cmp(two));
                    }
                    requests.push(Request::SynthNew {
                        synthdef: synthdef.name().to_string(),
                        node: node_index,
                        add_action: action,
                        target: target_index,
                        controls,
                    });
                }
            }
        }
        Ok(())
    }

    fn control_value(
        &self,
        value: ParamValue,
        parameter: Option<&Parameter>,
    ) -> Result<ControlValue, CompileError> {
        let takes_index = parameter.is_some_and(Parameter::takes_index);
        Ok(match value {
            ParamValue::Float(value) => ControlValue::Float(value),
            ParamValue::Buffer(id) => ControlValue::Int(self.mapping.buffer(id)?),
            ParamValue::BufferGroup(id) => ControlValue::Int(self.mapping.buffer_group(id)?),
            ParamValue::Bus(_) | ParamValue::BusGroup(_) => {
                let (index, rate) = self.bus_target(value)?;
                if takes_index {
                    ControlValue::Int(index)
                } else {
                    ControlValue::Symbol(map_symbol(index, rate))
                }
            }
        })
    }

    fn bus_target(&self, value: ParamValue) -> Result<(i32, CalculationRate), CompileError> {
        match value {
            ParamValue::Bus(id) => {
                let rate = self
                    .session
                    .bus(id)
                    .map(crate::model::Bus::rate)
                    .ok_or_else(|| CompileError::Unmapped(format!("bus {id}")))?;
                Ok((self.mapping.bus(id)?, rate))
            }
            ParamValue::BusGroup(id) => {
                let rate = self
                    .session
                    .bus_group(id)
                    .map(crate::model::BusGroup::rate)
                    .ok_or_else(|| CompileError::Unmapped(format!("bus group {id}")))?;
                Ok((self.mapping.bus_group(id)?, rate))
            }
            other => Err(CompileError::Unmapped(format!("{other} is not a bus"))),
        }
    }

    fn bus_sets(&self, offset: Offset, requests: &mut Vec<Request>) -> Result<(), CompileError> {
        let mut values = Vec::new();
        for bus in self.session.buses() {
            if let Some(value) = bus.events().at(offset) {
                values.push((self.mapping.bus(bus.id())?, *value));
            }
        }
        if !values.is_empty() {
            values.sort_by_key(|(index, _)| *index);
            requests.push(Request::ControlBusSet { values });
        }
        Ok(())
    }

    fn node_sets(
        &self,
        settings: Vec<(NodeId, BTreeMap<String, ParamValue>)>,
        requests: &mut Vec<Request>,
    ) -> Result<(), CompileError> {
        for (id, values) in settings {
            let Some(node) = self.node(id) else {
                continue;
            };
            let synthdef = node.synthdef();
            let mut plain = Vec::new();
            let mut audio = Vec::new();
            let mut control = Vec::new();
            for (name, value) in values {
                let parameter = synthdef.and_then(|synthdef| synthdef.parameter(&name));
                if parameter.is_some_and(|parameter| parameter.rate == ParameterRate::Scalar) {
                    continue;
                }
                match value {
                    ParamValue::Bus(_) | ParamValue::BusGroup(_) => match self.bus_target(value)? {
                        (index, CalculationRate::Audio) => audio.push((name, index)),
                        (index, CalculationRate::Control) => control.push((name, index)),
                    },
                    other => plain.push((name, self.control_value(other, parameter)?)),
                }
            }
            let node = self.mapping.node(id)?;
            if !plain.is_empty() {
                requests.push(Request::NodeSet {
                    node,
                    controls: plain,
                });
            }
            if !audio.is_empty() {
                requests.push(Request::NodeMapToAudioBus {
                    node,
                    mappings: audio,
                });
            }
            if !control.is_empty() {
                requests.push(Request::NodeMapToControlBus {
                    node,
                    mappings: control,
                });
            }
        }
        Ok(())
    }

    fn node_frees(
        &self,
        stop_nodes: &BTreeSet<NodeId>,
        requests: &mut Vec<Request>,
    ) -> Result<(), CompileError> {
        let mut freed = Vec::new();
        let mut released = Vec::new();
        for id in stop_nodes {
            let Some(node) = self.node(*id) else {
                continue;
            };
            let index = self.mapping.node(*id)?;
            if node.has_gate() {
                released.push(index);
            } else if node.duration() > 0.0 {
                freed.push(index);
            }
        }
        freed.sort_unstable();
        released.sort_unstable();
        if !freed.is_empty() {
            requests.push(Request::NodeFree { nodes: freed });
        }
        for node in released {
            requests.push(Request::NodeSet {
                node,
                controls: vec![("gate".to_string(), ControlValue::Float(0.0))],
            });
        }
        Ok(())
    }

    fn buffer_frees(
        &mut self,
        stop_buffers: &BTreeSet<BufferId>,
        requests: &mut Vec<Request>,
    ) -> Result<(), CompileError> {
        let mut indexed = stop_buffers
            .iter()
            .map(|id| Ok((self.mapping.buffer(*id)?, *id)))
            .collect::<Result<Vec<_>, CompileError>>()?;
        indexed.sort_unstable();
        for (index, id) in indexed {
            self.close_if_open(index, id, requests);
            requests.push(Request::BufferFree { buffer: index });
        }
        Ok(())
    }
}

fn count(value: u32) -> Result<i32, CompileError> {
    i32::try_from(value).map_err(|_| CompileError::Exhausted("frame or channel index"))
}

fn map_symbol(index: i32, rate: CalculationRate) -> String {
    match rate {
        CalculationRate::Audio => format!("a{index}"),
        CalculationRate::Control => format!("c{index}"),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        model::SynthDef,
        session::{AddBufferRequest, AddSynthRequest, WriteRequest},
    };

    fn synthdef(parameters: Vec<Parameter>) -> Arc<SynthDef> {
        Arc::new(SynthDef::new("tone", vec![1, 2, 3], parameters))
    }

    #[test]
    fn open_ended_sessions_need_a_duration() {
        let mut session = Session::default();
        session
            .add_synth(AddSynthRequest::new(synthdef(Vec::new())).at(0.0))
            .expect("synth should be added");
        assert!(matches!(compile(&session, None), Err(CompileError::DurationRequired)));
        assert!(matches!(
            compile(&session, Some(f64::INFINITY)),
            Err(CompileError::InvalidDuration(_))
        ));

        let bundles = compile(&session, Some(3.0)).expect("compile should succeed");
        let last = bundles.last().expect("bundles should not be empty");
        assert!((last.timestamp - 3.0).abs() < f64::EPSILON);
        assert_eq!(
            last.requests,
            vec![Request::NodeFree { nodes: vec![1000] }, Request::terminator()]
        );
    }

    #[test]
    fn bus_references_become_map_symbols_or_indices() {
        let parameters = vec![
            Parameter::control("frequency", 440.0),
            Parameter::control("out", 0.0),
        ];
        let mut session = Session::default();
        let frequency_bus = session.add_bus(CalculationRate::Control);
        let output = session.audio_output_bus_group();
        let synth = session
            .add_synth(
                AddSynthRequest::new(synthdef(parameters))
                    .param("frequency", frequency_bus)
                    .param("out", output)
                    .duration(2.0)
                    .at(0.0),
            )
            .expect("synth should be added");
        let audio_bus = session.add_bus(CalculationRate::Audio);
        session
            .set_param(synth, "frequency", audio_bus, Some(Offset::from(1.0)))
            .expect("param should be set");

        let bundles = compile(&session, None).expect("compile should succeed");
        let Request::SynthNew { controls, .. } = &bundles[0].requests[1] else {
            panic!("expected a synth creation, got {:?}", bundles[0].requests);
        };
        assert_eq!(
            controls,
            &vec![
                ("frequency".to_string(), ControlValue::Symbol("c0".to_string())),
                ("out".to_string(), ControlValue::Int(0)),
            ]
        );
        assert_eq!(
            bundles[1].requests,
            vec![Request::NodeMapToAudioBus {
                node: 1000,
                mappings: vec![("frequency".to_string(), 16)],
            }]
        );
    }

    #[test]
    fn buffers_allocate_write_and_free_in_order() {
        let mut session = Session::default();
        let buffer = session
            .add_buffer(AddBufferRequest::frames(2, 1024).duration(4.0).at(0.0))
            .expect("buffer should be added");
        session
            .zero_buffer(buffer, Some(Offset::ZERO))
            .expect("zero should be recorded");
        session
            .write_buffer(buffer, WriteRequest::new("capture.aiff"), Some(Offset::from(4.0)))
            .expect("write should be recorded");

        let bundles = compile(&session, None).expect("compile should succeed");
        let addresses: Vec<Vec<&str>> = bundles
            .iter()
            .map(|bundle| bundle.requests.iter().map(Request::address).collect())
            .collect();
        assert_eq!(
            addresses,
            vec![
                vec!["/b_alloc", "/b_zero"],
                vec!["/b_write", "/b_free", "/c_set"],
            ]
        );
    }

    #[test]
    fn gated_synths_are_released_instead_of_freed() {
        let parameters = vec![Parameter::control("gate", 1.0)];
        let mut session = Session::default();
        session
            .add_synth(AddSynthRequest::new(synthdef(parameters)).duration(1.0).at(0.0))
            .expect("synth should be added");
        let bundles = compile(&session, None).expect("compile should succeed");
        assert_eq!(
            bundles[1].requests[0],
            Request::NodeSet {
                node: 1000,
                controls: vec![("gate".to_string(), ControlValue::Float(0.0))],
            }
        );
    }
}
