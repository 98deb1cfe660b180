use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::{events::EventList, render::Renderable, session::Session, time::Offset};

pub const FIRST_NODE_ID: u32 = 1000;
pub const DEFAULT_CHANNEL_COUNT: u32 = 8;
pub const DEFAULT_MEMORY_SIZE: u32 = 8192;
pub const DEFAULT_CUE_FRAME_COUNT: u32 = 32_768;

macro_rules! session_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

session_id!(NodeId);
session_id!(BusId);
session_id!(BusGroupId);
session_id!(BufferId);
session_id!(BufferGroupId);

impl NodeId {
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddAction {
    AddToHead,
    AddToTail,
    AddBefore,
    AddAfter,
}

impl AddAction {
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::AddToHead => 0,
            Self::AddToTail => 1,
            Self::AddBefore => 2,
            Self::AddAfter => 3,
        }
    }

    #[must_use]
    pub fn is_sibling(self) -> bool {
        matches!(self, Self::AddBefore | Self::AddAfter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationRate {
    Audio,
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterRate {
    Scalar,
    Control,
    Audio,
    Trigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderFormat {
    Aiff,
    Wav,
    Next,
    Ircam,
    Raw,
}

impl HeaderFormat {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Aiff => "aiff",
            Self::Wav => "wav",
            Self::Next => "next",
            Self::Ircam => "ircam",
            Self::Raw => "raw",
        }
    }

    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Aiff => "aiff",
            Self::Wav => "wav",
            Self::Next => "au",
            Self::Ircam => "sf",
            Self::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    Int8,
    Int16,
    Int24,
    Int32,
    Float,
    Double,
    Mulaw,
    Alaw,
}

impl SampleFormat {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int16 => "int16",
            Self::Int24 => "int24",
            Self::Int32 => "int32",
            Self::Float => "float",
            Self::Double => "double",
            Self::Mulaw => "mulaw",
            Self::Alaw => "alaw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    pub default: f64,
    pub rate: ParameterRate,
}

impl Parameter {
    #[must_use]
    pub fn new(name: impl Into<String>, default: f64, rate: ParameterRate) -> Self {
        Self {
            name: name.into(),
            default,
            rate,
        }
    }

    #[must_use]
    pub fn control(name: impl Into<String>, default: f64) -> Self {
        Self::new(name, default, ParameterRate::Control)
    }

    #[must_use]
    pub fn scalar(name: impl Into<String>, default: f64) -> Self {
        Self::new(name, default, ParameterRate::Scalar)
    }

    /// Receives raw bus/buffer indices instead of map symbols.
    #[must_use]
    pub fn takes_index(&self) -> bool {
        self.rate == ParameterRate::Scalar || self.name == "in_" || self.name == "out"
    }
}

/// A compiled synth definition, consumed by reference only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthDef {
    name: String,
    compiled: Vec<u8>,
    parameters: Vec<Parameter>,
}

impl SynthDef {
    #[must_use]
    pub fn new(name: impl Into<String>, compiled: Vec<u8>, parameters: Vec<Parameter>) -> Self {
        Self {
            name: name.into(),
            compiled,
            parameters,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn compiled(&self) -> &[u8] {
        &self.compiled
    }

    #[must_use]
    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|parameter| parameter.name == name)
    }

    #[must_use]
    pub fn has_parameter(&self, name: &str) -> bool {
        self.parameter(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamValue {
    Float(f64),
    Bus(BusId),
    BusGroup(BusGroupId),
    Buffer(BufferId),
    BufferGroup(BufferGroupId),
}

impl ParamValue {
    #[must_use]
    pub fn as_float(self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(value) => write!(f, "{value:?}"),
            Self::Bus(id) => write!(f, "bus:{id}"),
            Self::BusGroup(id) => write!(f, "bus-group:{id}"),
            Self::Buffer(id) => write!(f, "buffer:{id}"),
            Self::BufferGroup(id) => write!(f, "buffer-group:{id}"),
        }
    }
}

impl From<f64> for ParamValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<BusId> for ParamValue {
    fn from(value: BusId) -> Self {
        Self::Bus(value)
    }
}

impl From<BusGroupId> for ParamValue {
    fn from(value: BusGroupId) -> Self {
        Self::BusGroup(value)
    }
}

impl From<BufferId> for ParamValue {
    fn from(value: BufferId) -> Self {
        Self::Buffer(value)
    }
}

impl From<BufferGroupId> for ParamValue {
    fn from(value: BufferGroupId) -> Self {
        Self::BufferGroup(value)
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Group,
    Synth {
        synthdef: Arc<SynthDef>,
        kwargs: BTreeMap<String, ParamValue>,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) start: Offset,
    pub(crate) stop: Offset,
    pub(crate) kind: NodeKind,
    pub(crate) events: BTreeMap<String, EventList<ParamValue>>,
}

impl Node {
    pub(crate) fn new(id: NodeId, start: Offset, stop: Offset, kind: NodeKind) -> Self {
        Self {
            id,
            start,
            stop,
            kind,
            events: BTreeMap::new(),
        }
    }

    pub(crate) fn root() -> Self {
        Self::new(
            NodeId::ROOT,
            Offset::NEG_INFINITY,
            Offset::INFINITY,
            NodeKind::Group,
        )
    }

    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub fn start(&self) -> Offset {
        self.start
    }

    #[must_use]
    pub fn stop(&self) -> Offset {
        self.stop
    }

    #[must_use]
    pub fn duration(&self) -> f64 {
        self.stop - self.start
    }

    #[must_use]
    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    #[must_use]
    pub fn is_group(&self) -> bool {
        matches!(self.kind, NodeKind::Group)
    }

    #[must_use]
    pub fn synthdef(&self) -> Option<&Arc<SynthDef>> {
        match &self.kind {
            NodeKind::Synth { synthdef, .. } => Some(synthdef),
            NodeKind::Group => None,
        }
    }

    #[must_use]
    pub fn kwargs(&self) -> Option<&BTreeMap<String, ParamValue>> {
        match &self.kind {
            NodeKind::Synth { kwargs, .. } => Some(kwargs),
            NodeKind::Group => None,
        }
    }

    #[must_use]
    pub fn events(&self) -> &BTreeMap<String, EventList<ParamValue>> {
        &self.events
    }

    /// Add actions accepted when this node is the target.
    #[must_use]
    pub fn valid_add_actions(&self) -> &'static [AddAction] {
        if self.id.is_root() {
            return &[AddAction::AddToHead, AddAction::AddToTail];
        }
        match self.kind {
            NodeKind::Group => &[
                AddAction::AddToHead,
                AddAction::AddToTail,
                AddAction::AddAfter,
                AddAction::AddBefore,
            ],
            NodeKind::Synth { .. } => &[AddAction::AddBefore, AddAction::AddAfter],
        }
    }

    #[must_use]
    pub fn default_add_action(&self) -> AddAction {
        self.valid_add_actions()[0]
    }

    /// Alive on `[start, stop)`; a zero-length node is alive only at its start.
    #[must_use]
    pub fn is_alive_at(&self, offset: Offset) -> bool {
        self.start <= offset && (offset < self.stop || offset == self.start)
    }

    #[must_use]
    pub fn has_gate(&self) -> bool {
        self.synthdef()
            .is_some_and(|synthdef| synthdef.has_parameter("gate"))
    }

    #[must_use]
    pub fn label(&self) -> &str {
        match &self.kind {
            NodeKind::Group => "group",
            NodeKind::Synth { synthdef, .. } => synthdef.name(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusRole {
    Private,
    HardwareInput,
    HardwareOutput,
}

#[derive(Debug, Clone)]
pub struct Bus {
    pub(crate) id: BusId,
    pub(crate) group: BusGroupId,
    pub(crate) rate: CalculationRate,
    pub(crate) events: EventList<f64>,
}

impl Bus {
    #[must_use]
    pub fn id(&self) -> BusId {
        self.id
    }

    #[must_use]
    pub fn group(&self) -> BusGroupId {
        self.group
    }

    #[must_use]
    pub fn rate(&self) -> CalculationRate {
        self.rate
    }

    #[must_use]
    pub fn events(&self) -> &EventList<f64> {
        &self.events
    }
}

/// Contiguous block of buses; a lone bus is a group of one.
#[derive(Debug, Clone)]
pub struct BusGroup {
    pub(crate) id: BusGroupId,
    pub(crate) rate: CalculationRate,
    pub(crate) role: BusRole,
    pub(crate) buses: Vec<BusId>,
}

impl BusGroup {
    #[must_use]
    pub fn id(&self) -> BusGroupId {
        self.id
    }

    #[must_use]
    pub fn rate(&self) -> CalculationRate {
        self.rate
    }

    #[must_use]
    pub fn role(&self) -> BusRole {
        self.role
    }

    #[must_use]
    pub fn buses(&self) -> &[BusId] {
        &self.buses
    }
}

/// Where a buffer or session input takes its audio from.
#[derive(Debug, Clone)]
pub enum AudioSource {
    File(PathBuf),
    Session(Arc<Session>),
    Renderable(Arc<dyn Renderable>),
}

impl AudioSource {
    #[must_use]
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(path.as_ref().to_path_buf())
    }
}

impl From<PathBuf> for AudioSource {
    fn from(value: PathBuf) -> Self {
        Self::File(value)
    }
}

impl From<Arc<Session>> for AudioSource {
    fn from(value: Arc<Session>) -> Self {
        Self::Session(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerateCommand {
    Sine1,
    Sine2,
    Sine3,
    Cheby,
}

impl GenerateCommand {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Sine1 => "sine1",
            Self::Sine2 => "sine2",
            Self::Sine3 => "sine3",
            Self::Cheby => "cheby",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateFlags {
    pub normalize: bool,
    pub wavetable: bool,
    pub clear: bool,
}

impl GenerateFlags {
    #[must_use]
    pub fn bits(self) -> i32 {
        i32::from(self.normalize) | (i32::from(self.wavetable) << 1) | (i32::from(self.clear) << 2)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generate {
    pub command: GenerateCommand,
    pub amplitudes: Vec<f64>,
    pub frequencies: Vec<f64>,
    pub phases: Vec<f64>,
    pub flags: GenerateFlags,
}

impl Generate {
    #[must_use]
    pub fn sine1(amplitudes: Vec<f64>, flags: GenerateFlags) -> Self {
        Self {
            command: GenerateCommand::Sine1,
            amplitudes,
            frequencies: Vec::new(),
            phases: Vec::new(),
            flags,
        }
    }

    #[must_use]
    pub fn chebyshev(amplitudes: Vec<f64>, flags: GenerateFlags) -> Self {
        Self {
            command: GenerateCommand::Cheby,
            ..Self::sine1(amplitudes, flags)
        }
    }

    /// Flattened coefficient list in the order the engine expects.
    #[must_use]
    pub fn coefficients(&self) -> Vec<f64> {
        match self.command {
            GenerateCommand::Sine1 | GenerateCommand::Cheby => self.amplitudes.clone(),
            GenerateCommand::Sine2 => self
                .frequencies
                .iter()
                .zip(&self.amplitudes)
                .flat_map(|(frequency, amplitude)| [*frequency, *amplitude])
                .collect(),
            GenerateCommand::Sine3 => self
                .frequencies
                .iter()
                .zip(&self.amplitudes)
                .zip(&self.phases)
                .flat_map(|((frequency, amplitude), phase)| [*frequency, *amplitude, *phase])
                .collect(),
        }
    }
}

/// Buffer commands in the order they compile within one offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferEventKind {
    Read,
    Zero,
    Fill,
    Generate,
    Set,
    SetContiguous,
    Normalize,
    Copy,
    Write,
    Close,
}

impl BufferEventKind {
    #[must_use]
    pub fn is_pre_free(self) -> bool {
        matches!(self, Self::Write | Self::Close)
    }
}

#[derive(Debug, Clone)]
pub enum BufferEvent {
    Read {
        source: AudioSource,
        channels: Option<Vec<u32>>,
        frame_count: Option<u32>,
        starting_frame_in_buffer: u32,
        starting_frame_in_file: u32,
        leave_open: bool,
    },
    Zero,
    Fill(Vec<(u32, u32, f64)>),
    Generate(Generate),
    Set(Vec<(u32, f64)>),
    SetContiguous(Vec<(u32, Vec<f64>)>),
    Normalize {
        new_maximum: f64,
        as_wavetable: bool,
    },
    Copy {
        target: BufferId,
        source_starting_frame: u32,
        target_starting_frame: u32,
        frame_count: Option<u32>,
    },
    Write {
        path: PathBuf,
        header_format: HeaderFormat,
        sample_format: SampleFormat,
        frame_count: Option<u32>,
        starting_frame: u32,
        leave_open: bool,
    },
    Close,
}

impl BufferEvent {
    #[must_use]
    pub fn kind(&self) -> BufferEventKind {
        match self {
            Self::Read { .. } => BufferEventKind::Read,
            Self::Zero => BufferEventKind::Zero,
            Self::Fill(_) => BufferEventKind::Fill,
            Self::Generate(_) => BufferEventKind::Generate,
            Self::Set(_) => BufferEventKind::Set,
            Self::SetContiguous(_) => BufferEventKind::SetContiguous,
            Self::Normalize { .. } => BufferEventKind::Normalize,
            Self::Copy { .. } => BufferEventKind::Copy,
            Self::Write { .. } => BufferEventKind::Write,
            Self::Close => BufferEventKind::Close,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub(crate) id: BufferId,
    pub(crate) group: Option<BufferGroupId>,
    pub(crate) start: Offset,
    pub(crate) stop: Offset,
    pub(crate) channel_count: Option<u32>,
    pub(crate) frame_count: Option<u32>,
    pub(crate) starting_frame: u32,
    pub(crate) source: Option<AudioSource>,
    pub(crate) events: BTreeMap<BufferEventKind, EventList<BufferEvent>>,
}

impl Buffer {
    #[must_use]
    pub fn id(&self) -> BufferId {
        self.id
    }

    #[must_use]
    pub fn group(&self) -> Option<BufferGroupId> {
        self.group
    }

    #[must_use]
    pub fn start(&self) -> Offset {
        self.start
    }

    #[must_use]
    pub fn stop(&self) -> Offset {
        self.stop
    }

    #[must_use]
    pub fn channel_count(&self) -> Option<u32> {
        self.channel_count
    }

    #[must_use]
    pub fn frame_count(&self) -> Option<u32> {
        self.frame_count
    }

    #[must_use]
    pub fn starting_frame(&self) -> u32 {
        self.starting_frame
    }

    #[must_use]
    pub fn source(&self) -> Option<&AudioSource> {
        self.source.as_ref()
    }

    #[must_use]
    pub fn events(&self) -> &BTreeMap<BufferEventKind, EventList<BufferEvent>> {
        &self.events
    }

    /// Buffer commands are accepted on the closed interval so writes can land on the stop offset.
    #[must_use]
    pub fn accepts_events_at(&self, offset: Offset) -> bool {
        self.start <= offset && offset <= self.stop
    }
}

#[derive(Debug, Clone)]
pub struct BufferGroup {
    pub(crate) id: BufferGroupId,
    pub(crate) buffers: Vec<BufferId>,
}

impl BufferGroup {
    #[must_use]
    pub fn id(&self) -> BufferGroupId {
        self.id
    }

    #[must_use]
    pub fn buffers(&self) -> &[BufferId] {
        &self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_add_actions_depend_on_target_kind() {
        let root = Node::root();
        assert_eq!(root.default_add_action(), AddAction::AddToHead);
        assert!(!root.valid_add_actions().contains(&AddAction::AddBefore));

        let synthdef = Arc::new(SynthDef::new("sine", vec![1, 2, 3], Vec::new()));
        let synth = Node::new(
            NodeId(1000),
            Offset::ZERO,
            Offset::from(1.0),
            NodeKind::Synth {
                synthdef,
                kwargs: BTreeMap::new(),
            },
        );
        assert_eq!(synth.default_add_action(), AddAction::AddBefore);
        assert!(!synth.valid_add_actions().contains(&AddAction::AddToHead));
    }

    #[test]
    fn generate_coefficients_interleave_per_command() {
        let generate = Generate {
            command: GenerateCommand::Sine3,
            amplitudes: vec![1.0, 0.5],
            frequencies: vec![1.0, 2.0],
            phases: vec![0.0, 0.25],
            flags: GenerateFlags::default(),
        };
        assert_eq!(generate.coefficients(), vec![1.0, 1.0, 0.0, 2.0, 0.5, 0.25]);

        let flags = GenerateFlags {
            normalize: true,
            wavetable: true,
            clear: true,
        };
        assert_eq!(flags.bits(), 7);
    }

    #[test]
    fn zero_length_nodes_are_alive_only_at_their_start() {
        let node = Node::new(NodeId(1000), Offset::from(2.0), Offset::from(2.0), NodeKind::Group);
        assert!(node.is_alive_at(Offset::from(2.0)));
        assert!(!node.is_alive_at(Offset::from(2.5)));
    }
}
