mod buffers;
mod buses;
mod moment;
mod nodes;

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

pub use buffers::{AddBufferRequest, CueRequest, ReadRequest, WriteRequest};
pub use moment::Moment;
pub use nodes::{AddGroupRequest, AddSynthRequest, ChildInspection, SplitOptions, SplitShards};

use crate::{
    interval::IntervalIndex,
    model::{
        AddAction, AudioSource, Buffer, BufferGroup, BufferGroupId, BufferId, Bus, BusGroup,
        BusGroupId, BusId, BusRole, CalculationRate, DEFAULT_CHANNEL_COUNT, DEFAULT_MEMORY_SIZE,
        FIRST_NODE_ID, Node, NodeId,
    },
    state::State,
    time::Offset,
    transition::{self, TransitionError, TreeShape},
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no active moment and no explicit offset")]
    NoActiveMoment,
    #[error("invalid offset: {0}")]
    InvalidOffset(f64),
    #[error("invalid duration: {0}")]
    InvalidDuration(f64),
    #[error("node {node} is not alive at offset {offset}")]
    NodeNotAlive { node: NodeId, offset: Offset },
    #[error("buffer {buffer} is not alive at offset {offset}")]
    BufferNotAlive { buffer: BufferId, offset: Offset },
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),
    #[error("bus not found: {0}")]
    BusNotFound(BusId),
    #[error("bus group not found: {0}")]
    BusGroupNotFound(BusGroupId),
    #[error("buffer not found: {0}")]
    BufferNotFound(BufferId),
    #[error("buffer group not found: {0}")]
    BufferGroupNotFound(BufferGroupId),
    #[error("can't add parent as a child: {node} is an ancestor of {target}")]
    ParentAsChild { node: NodeId, target: NodeId },
    #[error("node {0} cannot be placed relative to itself")]
    SelfTarget(NodeId),
    #[error("add action {action:?} is not valid for target {target}")]
    InvalidAddAction { action: AddAction, target: NodeId },
    #[error("the root node cannot be {0}")]
    RootImmutable(&'static str),
    #[error("synthdef {synthdef} has no parameter named {name}")]
    UnknownParameter { synthdef: String, name: String },
    #[error("bus {0} is not control-rate")]
    NotControlRate(BusId),
    #[error("cannot free node {node} at {offset}: it already stops at {stop}")]
    FreeAfterStop {
        node: NodeId,
        offset: Offset,
        stop: Offset,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("failed to read channel count from {path}: {reason}")]
    SoundfileHeader { path: PathBuf, reason: String },
    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Engine-facing options carried by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    pub input_bus_channel_count: u32,
    pub output_bus_channel_count: u32,
    pub audio_bus_channel_count: u32,
    pub control_bus_channel_count: u32,
    pub buffer_count: u32,
    pub memory_size: u32,
    pub padding: Option<f64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            input_bus_channel_count: DEFAULT_CHANNEL_COUNT,
            output_bus_channel_count: DEFAULT_CHANNEL_COUNT,
            audio_bus_channel_count: 1024,
            control_bus_channel_count: 16_384,
            buffer_count: 1024,
            memory_size: DEFAULT_MEMORY_SIZE,
            padding: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MomentFrame {
    offset: Offset,
    propagate: bool,
}

#[derive(Debug, Clone, Copy)]
struct Counters {
    node: u32,
    bus: u32,
    bus_group: u32,
    buffer: u32,
    buffer_group: u32,
}

impl Default for Counters {
    fn default() -> Self {
        Self {
            node: FIRST_NODE_ID,
            bus: 0,
            bus_group: 0,
            buffer: 0,
            buffer_group: 0,
        }
    }
}

fn bump(counter: &mut u32) -> u32 {
    let value = *counter;
    *counter += 1;
    value
}

/// An out-of-real-time timeline of nodes, buses and buffers.
///
/// Mutations happen inside a [`Moment`] (see [`Session::at`]) or with an
/// explicit offset; every structural edit is propagated forward through the
/// offset index before the call returns.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    name: Option<String>,
    created_at: DateTime<Utc>,
    options: SessionOptions,
    input: Option<AudioSource>,
    states: BTreeMap<Offset, State>,
    nodes: BTreeMap<NodeId, Node>,
    node_intervals: IntervalIndex<NodeId>,
    buses: BTreeMap<BusId, Bus>,
    bus_groups: BTreeMap<BusGroupId, BusGroup>,
    buffers: BTreeMap<BufferId, Buffer>,
    buffer_groups: BTreeMap<BufferGroupId, BufferGroup>,
    buffer_intervals: IntervalIndex<BufferId>,
    counters: Counters,
    moments: Vec<MomentFrame>,
    propagation_holds: usize,
    audio_output_buses: BusGroupId,
    audio_input_buses: BusGroupId,
}

impl Default for Session {
    fn default() -> Self {
        Self::new(SessionOptions::default())
    }
}

impl Session {
    #[must_use]
    pub fn new(options: SessionOptions) -> Self {
        let mut states = BTreeMap::new();
        states.insert(
            Offset::NEG_INFINITY,
            State::with_tree(Offset::NEG_INFINITY, Arc::new(TreeShape::root())),
        );
        states.insert(Offset::INFINITY, State::new(Offset::INFINITY));

        let mut session = Self {
            id: Uuid::new_v4(),
            name: None,
            created_at: Utc::now(),
            input: None,
            states,
            nodes: BTreeMap::from([(NodeId::ROOT, Node::root())]),
            node_intervals: IntervalIndex::default(),
            buses: BTreeMap::new(),
            bus_groups: BTreeMap::new(),
            buffers: BTreeMap::new(),
            buffer_groups: BTreeMap::new(),
            buffer_intervals: IntervalIndex::default(),
            counters: Counters::default(),
            moments: Vec::new(),
            propagation_holds: 0,
            audio_output_buses: BusGroupId(0),
            audio_input_buses: BusGroupId(0),
            options,
        };
        session.audio_output_buses = session.register_bus_group(
            session.options.output_bus_channel_count,
            CalculationRate::Audio,
            BusRole::HardwareOutput,
        );
        session.audio_input_buses = session.register_bus_group(
            session.options.input_bus_channel_count,
            CalculationRate::Audio,
            BusRole::HardwareInput,
        );
        session
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the audio fed into the engine's input buses.
    ///
    /// A session input must already be shared behind an `Arc`, so an input
    /// chain can never loop back onto the session consuming it.
    #[must_use]
    pub fn with_input(mut self, input: impl Into<AudioSource>) -> Self {
        self.input = Some(input.into());
        self
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    #[must_use]
    pub fn input(&self) -> Option<&AudioSource> {
        self.input.as_ref()
    }

    #[must_use]
    pub fn offsets(&self) -> Vec<Offset> {
        self.states.keys().copied().collect()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.values()
    }

    #[must_use]
    pub fn state_at(&self, offset: Offset) -> Option<&State> {
        self.states.get(&offset)
    }

    /// Nearest state strictly before `offset`, optionally skipping sparse ones.
    #[must_use]
    pub fn find_state_before(&self, offset: Offset, with_node_tree: bool) -> Option<&State> {
        self.states
            .range(..offset)
            .rev()
            .map(|(_, state)| state)
            .find(|state| !with_node_tree || state.is_dense())
    }

    /// Nearest state strictly after `offset`, optionally skipping sparse ones.
    #[must_use]
    pub fn find_state_after(&self, offset: Offset, with_node_tree: bool) -> Option<&State> {
        self.states
            .range((std::ops::Bound::Excluded(offset), std::ops::Bound::Unbounded))
            .map(|(_, state)| state)
            .find(|state| !with_node_tree || state.is_dense())
    }

    /// Tree shape in effect at `offset`.
    #[must_use]
    pub fn tree_at(&self, offset: Offset) -> Arc<TreeShape> {
        self.states
            .range(..=offset)
            .rev()
            .find_map(|(_, state)| state.tree.clone())
            .unwrap_or_else(|| Arc::new(TreeShape::root()))
    }

    /// Tree shape in effect just before `offset`.
    #[must_use]
    pub fn tree_before(&self, offset: Offset) -> Arc<TreeShape> {
        self.find_state_before(offset, true)
            .and_then(|state| state.tree.clone())
            .unwrap_or_else(|| Arc::new(TreeShape::root()))
    }

    /// Last finite offset carrying a state or an event.
    #[must_use]
    pub fn last_offset(&self) -> Offset {
        let states = self.states.keys().copied();
        let node_events = self
            .nodes
            .values()
            .flat_map(|node| node.events.values().flat_map(|events| events.offsets()));
        let bus_events = self.buses.values().flat_map(|bus| bus.events.offsets());
        let buffer_events = self
            .buffers
            .values()
            .flat_map(|buffer| buffer.events.values().flat_map(|events| events.offsets()));
        states
            .chain(node_events)
            .chain(bus_events)
            .chain(buffer_events)
            .filter(|offset| offset.is_finite())
            .max()
            .unwrap_or(Offset::ZERO)
    }

    /// True when some node or buffer outlives every finite offset.
    #[must_use]
    pub fn is_open_ended(&self) -> bool {
        let last = self.last_offset();
        self.node_intervals.max_stop().is_some_and(|stop| stop > last)
            || self.buffer_intervals.max_stop().is_some_and(|stop| stop > last)
    }

    /// Last finite offset plus padding.
    #[must_use]
    pub fn duration(&self) -> f64 {
        let last = self.last_offset().seconds().max(0.0);
        match self.options.padding {
            Some(padding) if last > 0.0 && padding > 0.0 => last + padding,
            _ => last,
        }
    }

    #[must_use]
    pub fn active_offset(&self) -> Option<Offset> {
        self.moments.last().map(|frame| frame.offset)
    }

    /// Opens a mutation scope at `offset`, propagating on entry and exit.
    pub fn at(&mut self, offset: impl Into<Offset>) -> Result<Moment<'_>, SessionError> {
        let offset = offset.into();
        self.enter_moment(offset, true)?;
        Ok(Moment::new(self, offset, true))
    }

    /// Opens a mutation scope that leaves propagation to the caller.
    pub fn at_without_propagation(
        &mut self,
        offset: impl Into<Offset>,
    ) -> Result<Moment<'_>, SessionError> {
        let offset = offset.into();
        self.enter_moment(offset, false)?;
        Ok(Moment::new(self, offset, false))
    }

    /// Recomputes every dense state's transitions from adjacent tree shapes.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn rebuild_transitions(&mut self) -> Result<(), SessionError> {
        let dense: Vec<Offset> = self
            .states
            .iter()
            .filter(|(_, state)| state.is_dense())
            .map(|(offset, _)| *offset)
            .collect();
        for pair in dense.windows(2) {
            self.rebuild_state_transitions(pair[0], pair[1])?;
        }
        debug!(states = dense.len(), "transitions rebuilt");
        Ok(())
    }

    pub(crate) fn rebuild_state_transitions(
        &mut self,
        previous: Offset,
        offset: Offset,
    ) -> Result<(), SessionError> {
        let Some(one) = self.states.get(&previous).and_then(|state| state.tree.clone()) else {
            return Ok(());
        };
        let Some(state) = self.states.get_mut(&offset) else {
            return Ok(());
        };
        let Some(two) = state.tree.clone() else {
            return Ok(());
        };
        state.transitions = transition::diff(&one, &two, &state.stop_nodes)?;
        Ok(())
    }

    pub(crate) fn enter_moment(
        &mut self,
        offset: Offset,
        propagate: bool,
    ) -> Result<(), SessionError> {
        if !offset.is_finite() || offset < Offset::ZERO {
            return Err(SessionError::InvalidOffset(offset.seconds()));
        }
        self.state_entry(offset);
        if propagate {
            self.propagate(&[offset])?;
        }
        self.moments.push(MomentFrame { offset, propagate });
        trace!(%offset, depth = self.moments.len(), "moment entered");
        Ok(())
    }

    pub(crate) fn exit_moment(&mut self) -> Result<(), SessionError> {
        let Some(frame) = self.moments.pop() else {
            return Ok(());
        };
        let result = if frame.propagate {
            self.propagate(&[frame.offset])
        } else {
            Ok(())
        };
        self.sparsify(frame.offset);
        trace!(offset = %frame.offset, depth = self.moments.len(), "moment exited");
        result
    }

    /// Runs `op` at the explicit offset, or at the innermost moment's offset.
    pub(crate) fn scoped<T>(
        &mut self,
        offset: Option<Offset>,
        op: impl FnOnce(&mut Self, Offset) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        match offset {
            Some(offset) if self.active_offset() != Some(offset) => {
                self.enter_moment(offset, true)?;
                let result = op(self, offset);
                let exited = self.exit_moment();
                let value = result?;
                exited?;
                Ok(value)
            }
            Some(offset) => op(self, offset),
            None => {
                let offset = self.active_offset().ok_or(SessionError::NoActiveMoment)?;
                op(self, offset)
            }
        }
    }

    pub(crate) fn resolve_offset(&self, offset: Option<Offset>) -> Result<Offset, SessionError> {
        offset
            .or_else(|| self.active_offset())
            .ok_or(SessionError::NoActiveMoment)
    }

    /// Runs `op` with propagation suspended; callers propagate afterwards.
    pub(crate) fn without_propagation<T>(&mut self, op: impl FnOnce(&mut Self) -> T) -> T {
        self.propagation_holds += 1;
        let result = op(self);
        self.propagation_holds -= 1;
        result
    }

    /// Runs a node edit, putting states and nodes back if it fails part way.
    pub(crate) fn transact<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let states = self.states.clone();
        let nodes = self.nodes.clone();
        let node_intervals = self.node_intervals.clone();
        let result = op(self);
        if let Err(error) = &result {
            debug!(%error, "node edit rolled back");
            self.states = states;
            self.nodes = nodes;
            self.node_intervals = node_intervals;
        }
        result
    }

    pub(crate) fn state_entry(&mut self, offset: Offset) -> &mut State {
        self.states
            .entry(offset)
            .or_insert_with(|| State::new(offset))
    }

    /// Materializes a sparse state from the nearest preceding dense one.
    pub(crate) fn desparsify(&mut self, offset: Offset) {
        if self.states.get(&offset).is_none_or(State::is_dense) {
            return;
        }
        let inherited = self.tree_before(offset);
        if let Some(state) = self.states.get_mut(&offset) {
            state.tree = Some(inherited);
        }
    }

    /// Drops a state that no longer carries edits of its own.
    pub(crate) fn sparsify(&mut self, offset: Offset) {
        if !offset.is_finite() || self.moments.iter().any(|frame| frame.offset == offset) {
            return;
        }
        if self.states.get(&offset).is_some_and(State::is_sparse) {
            self.states.remove(&offset);
            trace!(%offset, "sparse state removed");
        }
    }

    /// Re-applies transitions at `offsets`, chaining forward while shapes change.
    pub(crate) fn propagate(&mut self, offsets: &[Offset]) -> Result<(), SessionError> {
        if self.propagation_holds > 0 {
            return Ok(());
        }
        let mut queue: BTreeSet<Offset> = offsets
            .iter()
            .copied()
            .filter(|offset| *offset != Offset::NEG_INFINITY)
            .collect();
        while let Some(offset) = queue.pop_first() {
            let Some(state) = self.states.get(&offset) else {
                continue;
            };
            let previous = self.tree_before(offset);
            let shape = transition::apply_all(&previous, &state.transitions, &state.stop_nodes)?;
            if state.tree.as_deref() == Some(&shape) {
                continue;
            }
            // unchanged shapes keep sharing the previous state's allocation
            let shape = if shape == *previous {
                previous
            } else {
                Arc::new(shape)
            };
            if let Some(state) = self.states.get_mut(&offset) {
                state.tree = Some(shape);
            }
            let next = self
                .states
                .range((std::ops::Bound::Excluded(offset), std::ops::Bound::Unbounded))
                .find(|(_, state)| state.is_dense() || !state.is_sparse())
                .map(|(offset, _)| *offset);
            if let Some(next) = next {
                queue.insert(next);
            }
        }
        Ok(())
    }

    pub(crate) fn next_node_id(&mut self) -> NodeId {
        NodeId(bump(&mut self.counters.node))
    }

    pub(crate) fn next_bus_id(&mut self) -> BusId {
        BusId(bump(&mut self.counters.bus))
    }

    pub(crate) fn next_bus_group_id(&mut self) -> BusGroupId {
        BusGroupId(bump(&mut self.counters.bus_group))
    }

    pub(crate) fn next_buffer_id(&mut self) -> BufferId {
        BufferId(bump(&mut self.counters.buffer))
    }

    pub(crate) fn next_buffer_group_id(&mut self) -> BufferGroupId {
        BufferGroupId(bump(&mut self.counters.buffer_group))
    }

    /// Every audio source this session reads: its input plus buffer reads.
    #[must_use]
    pub fn audio_sources(&self) -> Vec<AudioSource> {
        let mut sources: Vec<AudioSource> = self.input.iter().cloned().collect();
        for buffer in self.buffers.values() {
            sources.extend(buffer.source.iter().cloned());
            for events in buffer.events.values() {
                for (_, event) in events.iter() {
                    if let crate::model::BufferEvent::Read { source, .. } = event {
                        sources.push(source.clone());
                    }
                }
            }
        }
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_sessions_hold_only_the_sentinels() {
        let session = Session::default();
        assert_eq!(
            session.offsets(),
            vec![Offset::NEG_INFINITY, Offset::INFINITY]
        );
        assert_eq!(*session.tree_at(Offset::from(3.0)), TreeShape::root());
        assert!((session.duration() - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_moments_leave_no_state_behind() {
        let mut session = Session::default();
        {
            let moment = session.at(3.0).expect("moment should open");
            assert_eq!(moment.offset(), Offset::from(3.0));
            assert!(moment.state_at(Offset::from(3.0)).is_some());
        }
        assert!(session.state_at(Offset::from(3.0)).is_none());
        assert!(session.active_offset().is_none());
    }

    #[test]
    fn negative_and_infinite_offsets_are_rejected() {
        let mut session = Session::default();
        assert!(matches!(
            session.at(-1.0),
            Err(SessionError::InvalidOffset(_))
        ));
        assert!(matches!(
            session.at(f64::INFINITY),
            Err(SessionError::InvalidOffset(_))
        ));
    }

    #[test]
    fn sparse_lookups_skip_unmaterialized_states() {
        let mut session = Session::default();
        session.state_entry(Offset::from(2.0));
        assert!(
            session
                .find_state_before(Offset::from(5.0), false)
                .is_some_and(|state| state.offset() == Offset::from(2.0))
        );
        assert!(
            session
                .find_state_before(Offset::from(5.0), true)
                .is_some_and(|state| state.offset() == Offset::NEG_INFINITY)
        );
        session.desparsify(Offset::from(2.0));
        assert!(
            session
                .find_state_after(Offset::ZERO, true)
                .is_some_and(|state| state.offset() == Offset::from(2.0))
        );
    }
}
