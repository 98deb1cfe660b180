pub mod commands;
pub mod compiler;
pub mod config;
pub mod diagnostics;
pub mod events;
pub mod fixtures;
pub mod ids;
pub mod interval;
pub mod model;
pub mod persistence;
pub mod process;
pub mod render;
pub mod report;
pub mod session;
pub mod state;
pub mod time;
pub mod transition;

pub use commands::{
    ControlValue, FileSource, RenderKey, Request, RequestBundle, decode_datagram, encode_datagram,
    no_dependencies,
};
pub use compiler::{CompileError, compile};
pub use config::{DiagnosticsConfig, ScorelineConfig};
pub use diagnostics::{
    TelemetryGuard, TracingOptions, init_tracing, init_tracing_from_config, install_tracing,
};
pub use ids::{BlockAllocator, IdMapping};
pub use model::{
    AddAction, AudioSource, Buffer, BufferEvent, BufferGroup, BufferGroupId, BufferId, Bus,
    BusGroup, BusGroupId, BusId, CalculationRate, Generate, GenerateCommand, GenerateFlags,
    HeaderFormat, Node, NodeId, NodeKind, ParamValue, Parameter, ParameterRate, SampleFormat,
    SynthDef,
};
pub use render::{
    CancelToken, DependencyGraph, RenderAttempt, RenderError, RenderManifest, RenderOptions,
    RenderOutcome, RenderStep, Renderable, Renderer,
};
pub use report::{SessionReport, StateReport};
pub use session::{
    AddBufferRequest, AddGroupRequest, AddSynthRequest, ChildInspection, CueRequest, Moment,
    ReadRequest, Session, SessionError, SessionOptions, SplitOptions, SplitShards, WriteRequest,
};
pub use state::State;
pub use time::Offset;
pub use transition::{NodeAction, NodeTransition, TransitionError, Transitions, TreeShape};
