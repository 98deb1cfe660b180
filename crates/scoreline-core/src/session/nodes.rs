use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, info, instrument};

use super::{Session, SessionError};
use crate::{
    model::{AddAction, Node, NodeId, NodeKind, ParamValue, SynthDef},
    time::Offset,
    transition::{self, NodeTransition, Transitions, TreeShape},
};

#[derive(Debug, Clone)]
pub struct AddGroupRequest {
    pub target: NodeId,
    pub add_action: Option<AddAction>,
    pub duration: f64,
    pub offset: Option<Offset>,
}

impl Default for AddGroupRequest {
    fn default() -> Self {
        Self {
            target: NodeId::ROOT,
            add_action: None,
            duration: f64::INFINITY,
            offset: None,
        }
    }
}

impl AddGroupRequest {
    #[must_use]
    pub fn target(mut self, target: NodeId, add_action: AddAction) -> Self {
        self.target = target;
        self.add_action = Some(add_action);
        self
    }

    #[must_use]
    pub fn duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn at(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = Some(offset.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct AddSynthRequest {
    pub synthdef: Arc<SynthDef>,
    pub target: NodeId,
    pub add_action: Option<AddAction>,
    pub duration: f64,
    pub kwargs: BTreeMap<String, ParamValue>,
    pub offset: Option<Offset>,
}

impl AddSynthRequest {
    #[must_use]
    pub fn new(synthdef: Arc<SynthDef>) -> Self {
        Self {
            synthdef,
            target: NodeId::ROOT,
            add_action: None,
            duration: f64::INFINITY,
            kwargs: BTreeMap::new(),
            offset: None,
        }
    }

    #[must_use]
    pub fn target(mut self, target: NodeId, add_action: AddAction) -> Self {
        self.target = target;
        self.add_action = Some(add_action);
        self
    }

    #[must_use]
    pub fn duration(mut self, duration: f64) -> Self {
        self.duration = duration;
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn at(mut self, offset: impl Into<Offset>) -> Self {
        self.offset = Some(offset.into());
        self
    }
}

/// How a node's children relate to it across one offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildInspection {
    pub entering: Vec<NodeId>,
    pub exiting: Vec<NodeId>,
    pub occupying: Vec<NodeId>,
    pub starting: Vec<NodeId>,
    pub stopping: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitOptions {
    /// Split children present on both sides of the split.
    pub occupiers: bool,
    /// Split children moving in or out at the split.
    pub traversers: bool,
}

impl Default for SplitOptions {
    fn default() -> Self {
        Self {
            occupiers: true,
            traversers: true,
        }
    }
}

impl SplitOptions {
    fn uniform(value: bool) -> Self {
        Self {
            occupiers: value,
            traversers: value,
        }
    }
}

/// Result of splitting a node: the original keeps `[start, split)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitShards {
    pub head: NodeId,
    pub tail: Option<NodeId>,
    /// `(original, twin)` pairs for every node split, the head first.
    pub twins: Vec<(NodeId, NodeId)>,
}

impl Session {
    #[instrument(skip(self, request), fields(session_id = %self.id, target = %request.target))]
    pub fn add_group(&mut self, request: AddGroupRequest) -> Result<NodeId, SessionError> {
        self.transact(|session| {
            session.scoped(request.offset, |session, offset| {
                session.insert_node(
                    NodeKind::Group,
                    request.target,
                    request.add_action,
                    request.duration,
                    offset,
                )
            })
        })
    }

    #[instrument(
        skip(self, request),
        fields(session_id = %self.id, synthdef = %request.synthdef.name())
    )]
    pub fn add_synth(&mut self, request: AddSynthRequest) -> Result<NodeId, SessionError> {
        for name in request.kwargs.keys() {
            if !request.synthdef.has_parameter(name) {
                return Err(SessionError::UnknownParameter {
                    synthdef: request.synthdef.name().to_string(),
                    name: name.clone(),
                });
            }
        }
        let kind = NodeKind::Synth {
            synthdef: request.synthdef,
            kwargs: request.kwargs,
        };
        self.transact(|session| {
            session.scoped(request.offset, |session, offset| {
                session.insert_node(
                    kind,
                    request.target,
                    request.add_action,
                    request.duration,
                    offset,
                )
            })
        })
    }

    fn insert_node(
        &mut self,
        kind: NodeKind,
        target: NodeId,
        add_action: Option<AddAction>,
        duration: f64,
        offset: Offset,
    ) -> Result<NodeId, SessionError> {
        if duration.is_nan() || duration < 0.0 {
            return Err(SessionError::InvalidDuration(duration));
        }
        let action = self.check_target(target, add_action, offset)?;
        let id = self.next_node_id();
        let stop = offset + duration;
        self.state_entry(offset).start_nodes.insert(id);
        self.state_entry(stop).stop_nodes.insert(id);
        self.nodes.insert(id, Node::new(id, offset, stop, kind));
        self.node_intervals.insert(id, offset, stop);
        self.place_node(id, action, target, offset)?;
        info!(node = %id, %offset, %stop, "node added");
        Ok(id)
    }

    fn check_target(
        &self,
        target: NodeId,
        add_action: Option<AddAction>,
        offset: Offset,
    ) -> Result<AddAction, SessionError> {
        let target_node = self
            .nodes
            .get(&target)
            .ok_or(SessionError::NodeNotFound(target))?;
        let action = add_action.unwrap_or_else(|| target_node.default_add_action());
        if !target_node.valid_add_actions().contains(&action) {
            return Err(SessionError::InvalidAddAction { action, target });
        }
        if !target_node.is_alive_at(offset) || target_node.stop == offset {
            return Err(SessionError::NodeNotAlive {
                node: target,
                offset,
            });
        }
        Ok(action)
    }

    /// Moves `node` relative to `target` at the active or explicit offset.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn move_node(
        &mut self,
        node: NodeId,
        add_action: AddAction,
        target: NodeId,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        if node.is_root() {
            return Err(SessionError::RootImmutable("moved"));
        }
        self.transact(|session| {
            session.scoped(offset, |session, offset| {
                let moved = session
                    .nodes
                    .get(&node)
                    .ok_or(SessionError::NodeNotFound(node))?;
                if !moved.is_alive_at(offset) {
                    return Err(SessionError::NodeNotAlive { node, offset });
                }
                session.check_target(target, Some(add_action), offset)?;
                session.place_node(node, add_action, target, offset)
            })
        })
    }

    fn place_node(
        &mut self,
        node: NodeId,
        add_action: AddAction,
        target: NodeId,
        offset: Offset,
    ) -> Result<(), SessionError> {
        if node == target {
            return Err(SessionError::SelfTarget(node));
        }
        self.desparsify(offset);
        if self.tree_at(offset).parentage(target).contains(&node) {
            return Err(SessionError::ParentAsChild { node, target });
        }
        let stop = self
            .nodes
            .get(&node)
            .map_or(Offset::INFINITY, |existing| existing.stop);
        let placement = NodeTransition::add(node, add_action, target);
        let previous = self.tree_before(offset);
        let current = self.tree_at(offset);
        let state = self.state_entry(offset);
        let mut transitions = state.transitions.clone();
        transitions.insert(placement);
        // a replaced transition can precede the transition creating its target
        if transition::apply_all(&previous, &transitions, &state.stop_nodes).is_err() {
            let mut desired = (*current).clone();
            desired.apply(&placement)?;
            transitions = transition::diff(&previous, &desired, &state.stop_nodes)?;
        }
        state.transitions = transitions;
        debug!(%node, ?add_action, %target, %offset, "node placed");
        self.propagate(&[offset, stop])
    }

    /// Records a parameter value for a live node.
    pub fn set_param(
        &mut self,
        node: NodeId,
        name: &str,
        value: impl Into<ParamValue>,
        offset: Option<Offset>,
    ) -> Result<(), SessionError> {
        let offset = self.resolve_offset(offset)?;
        let target = self
            .nodes
            .get_mut(&node)
            .ok_or(SessionError::NodeNotFound(node))?;
        if !(target.start <= offset && offset < target.stop) {
            return Err(SessionError::NodeNotAlive { node, offset });
        }
        if let Some(synthdef) = target.synthdef() {
            if !synthdef.has_parameter(name) {
                return Err(SessionError::UnknownParameter {
                    synthdef: synthdef.name().to_string(),
                    name: name.to_string(),
                });
            }
        }
        target
            .events
            .entry(name.to_string())
            .or_default()
            .set(offset, value.into());
        Ok(())
    }

    /// Parameter value in effect at `offset`: recorded events, then
    /// creation arguments, then the synthdef default.
    pub fn param(
        &self,
        node: NodeId,
        name: &str,
        offset: Option<Offset>,
    ) -> Result<Option<ParamValue>, SessionError> {
        let offset = self.resolve_offset(offset)?;
        let target = self.node(node).ok_or(SessionError::NodeNotFound(node))?;
        let recorded = target.events.get(name).and_then(|events| events.get(offset));
        if let Some((_, value)) = recorded {
            return Ok(Some(*value));
        }
        if let Some(value) = target.kwargs().and_then(|kwargs| kwargs.get(name)) {
            return Ok(Some(*value));
        }
        Ok(target
            .synthdef()
            .and_then(|synthdef| synthdef.parameter(name))
            .map(|parameter| ParamValue::Float(parameter.default)))
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    /// Every node except the root, ordered by id.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|node| !node.id.is_root())
    }

    /// Nodes whose lifetime contains `offset`.
    #[must_use]
    pub fn nodes_at(&self, offset: Offset) -> Vec<NodeId> {
        self.node_intervals.find_intersection(offset)
    }

    pub fn parent(
        &self,
        node: NodeId,
        offset: Option<Offset>,
    ) -> Result<Option<NodeId>, SessionError> {
        let offset = self.resolve_offset(offset)?;
        let target = self.node(node).ok_or(SessionError::NodeNotFound(node))?;
        let tree = if target.stop == offset {
            self.tree_before(offset)
        } else {
            self.tree_at(offset)
        };
        Ok(tree.parent(node))
    }

    /// The node followed by its ancestors up to the root.
    pub fn parentage(
        &self,
        node: NodeId,
        offset: Option<Offset>,
    ) -> Result<Vec<NodeId>, SessionError> {
        let offset = self.resolve_offset(offset)?;
        let target = self.node(node).ok_or(SessionError::NodeNotFound(node))?;
        let tree = if target.stop == offset {
            self.tree_before(offset)
        } else {
            self.tree_at(offset)
        };
        Ok(tree.parentage(node))
    }

    pub fn children(
        &self,
        node: NodeId,
        offset: Option<Offset>,
    ) -> Result<Vec<NodeId>, SessionError> {
        let offset = self.resolve_offset(offset)?;
        if self.node(node).is_none() {
            return Err(SessionError::NodeNotFound(node));
        }
        Ok(self.tree_at(offset).children(node).to_vec())
    }

    pub fn inspect_children(
        &self,
        node: NodeId,
        offset: Option<Offset>,
    ) -> Result<ChildInspection, SessionError> {
        let offset = self.resolve_offset(offset)?;
        if self.node(node).is_none() {
            return Err(SessionError::NodeNotFound(node));
        }
        Ok(self.inspect_children_at(node, offset))
    }

    fn inspect_children_at(&self, node: NodeId, offset: Offset) -> ChildInspection {
        let before = self.tree_before(offset);
        let after = self.tree_at(offset);
        let previous = before.children(node);
        let current = after.children(node);
        let mut inspection = ChildInspection::default();
        let stops_here =
            |child: &NodeId| self.node(*child).is_some_and(|child| child.stop == offset);
        let starts_here =
            |child: &NodeId| self.node(*child).is_some_and(|child| child.start == offset);

        for child in previous {
            if stops_here(child) {
                inspection.stopping.push(*child);
            } else if current.contains(child) {
                inspection.occupying.push(*child);
            } else {
                inspection.exiting.push(*child);
            }
        }
        for child in current {
            if starts_here(child) {
                inspection.starting.push(*child);
            } else if stops_here(child) {
                inspection.stopping.push(*child);
            } else if !previous.contains(child) {
                inspection.entering.push(*child);
            }
        }
        for list in [
            &mut inspection.entering,
            &mut inspection.exiting,
            &mut inspection.occupying,
            &mut inspection.starting,
            &mut inspection.stopping,
        ] {
            list.sort_unstable();
            list.dedup();
        }
        inspection
    }

    /// Splits `node` in two at the offset; the twin continues its
    /// children, parameters and position from there on.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn split_node(
        &mut self,
        node: NodeId,
        options: SplitOptions,
        offset: Option<Offset>,
    ) -> Result<SplitShards, SessionError> {
        if node.is_root() {
            return Err(SessionError::RootImmutable("split"));
        }
        if self.node(node).is_none() {
            return Err(SessionError::NodeNotFound(node));
        }
        self.transact(|session| {
            session.scoped(offset, |session, split| {
                let twins = session.split_and_propagate(node, split, options)?;
                let tail = twins.first().map(|(_, twin)| *twin);
                info!(%node, %split, twins = twins.len(), "node split");
                Ok(SplitShards {
                    head: node,
                    tail,
                    twins,
                })
            })
        })
    }

    fn split_and_propagate(
        &mut self,
        node: NodeId,
        split: Offset,
        options: SplitOptions,
    ) -> Result<Vec<(NodeId, NodeId)>, SessionError> {
        self.propagate(&[split])?;
        let mut twins = Vec::new();
        self.split_at(node, split, options, &mut twins)?;
        let last_stop = twins
            .iter()
            .filter_map(|(_, twin)| self.node(*twin).map(Node::stop))
            .max()
            .unwrap_or(split);
        let offsets: Vec<Offset> = self
            .states
            .range(split..=last_stop)
            .map(|(offset, _)| *offset)
            .collect();
        self.propagate(&offsets)?;
        Ok(twins)
    }

    fn split_at(
        &mut self,
        node: NodeId,
        split: Offset,
        options: SplitOptions,
        twins: &mut Vec<(NodeId, NodeId)>,
    ) -> Result<(), SessionError> {
        let original = self.node(node).ok_or(SessionError::NodeNotFound(node))?;
        let (start, stop) = (original.start, original.stop);
        if !(start < split && split < stop) {
            return Ok(());
        }
        let kind = original.kind.clone();
        let inspection = self.inspect_children_at(node, split);
        let children = self.tree_at(split).children(node).to_vec();

        let twin = self.without_propagation(|session| {
            session.insert_node(kind, node, Some(AddAction::AddBefore), stop - split, split)
        })?;
        twins.push((node, twin));

        let state = self.state_entry(split);
        let mut previous = std::mem::take(&mut state.transitions);
        let mut rebuilt = Transitions::new();
        for (_, earlier) in twins.iter() {
            if *earlier == twin {
                if let Some(own) = previous.remove(node) {
                    previous.remove(twin);
                    rebuilt.insert(own.with_source(twin));
                    continue;
                }
            }
            if let Some(transition) = previous.remove(*earlier) {
                rebuilt.insert(transition);
            }
        }
        for child in &children {
            previous.remove(*child);
            rebuilt.insert(NodeTransition::add(*child, AddAction::AddToTail, twin));
        }
        for transition in previous {
            rebuilt.insert(transition);
        }
        state.transitions = rebuilt;

        self.split_events(node, twin, split);
        self.retime_stop(node, split);
        self.hand_over_transitions(node, twin, split, stop);
        self.propagate(&[split, stop])?;

        let mut candidates = children;
        candidates.extend(inspection.exiting.iter().copied());
        for child in candidates {
            let occupier = inspection.occupying.contains(&child);
            let traverser =
                inspection.entering.contains(&child) || inspection.exiting.contains(&child);
            if (options.occupiers && occupier) || (options.traversers && traverser) {
                self.split_at(child, split, options, twins)?;
            }
        }
        Ok(())
    }

    /// Events before `split` stay; the rest move to the twin, which also
    /// inherits each parameter's last value at the split.
    fn split_events(&mut self, node: NodeId, twin: NodeId, split: Offset) {
        let Some(original) = self.nodes.get_mut(&node) else {
            return;
        };
        let mut right = BTreeMap::new();
        for (name, events) in &mut original.events {
            let mut tail = events.split_off(split);
            if tail.at(split).is_none() {
                if let Some((_, value)) = events.last() {
                    tail.set(split, *value);
                }
            }
            if !tail.is_empty() {
                right.insert(name.clone(), tail);
            }
        }
        original.events.retain(|_, events| !events.is_empty());
        if let Some(twin) = self.nodes.get_mut(&twin) {
            twin.events = right;
        }
    }

    fn retime_stop(&mut self, node: NodeId, new_stop: Offset) {
        let Some(target) = self.nodes.get_mut(&node) else {
            return;
        };
        let old_stop = target.stop;
        if old_stop == new_stop {
            return;
        }
        target.stop = new_stop;
        let start = target.start;
        self.node_intervals.insert(node, start, new_stop);
        if let Some(state) = self.states.get_mut(&old_stop) {
            state.stop_nodes.remove(&node);
        }
        self.sparsify(old_stop);
        self.state_entry(new_stop).stop_nodes.insert(node);
    }

    /// Transitions in `[from, to]` naming `node` now name `twin`.
    fn hand_over_transitions(&mut self, node: NodeId, twin: NodeId, from: Offset, to: Offset) {
        for state in self.states.range_mut(from..=to).map(|(_, state)| state) {
            if state.transitions.contains(twin) {
                state.transitions.remove(node);
            }
            let has_twin = state.transitions.contains(twin);
            for transition in state.transitions.iter_mut() {
                if transition.source == node && !has_twin {
                    *transition = transition.with_source(twin);
                } else if transition.source != twin && transition.target() == Some(node) {
                    *transition = transition.with_target(twin);
                }
            }
        }
    }

    /// Removes a node entirely; its children take its place in each state.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn delete_node(&mut self, node: NodeId) -> Result<(), SessionError> {
        if node.is_root() {
            return Err(SessionError::RootImmutable("deleted"));
        }
        let target = self.node(node).ok_or(SessionError::NodeNotFound(node))?;
        let (start, stop) = (target.start, target.stop);
        self.transact(|session| {
            let rebuilt = session.trees_without(node, start, stop)?;
            if let Some(state) = session.states.get_mut(&start) {
                state.start_nodes.remove(&node);
            }
            if let Some(state) = session.states.get_mut(&stop) {
                state.stop_nodes.remove(&node);
            }
            for (offset, tree, transitions) in rebuilt {
                if let Some(state) = session.states.get_mut(&offset) {
                    state.tree = Some(tree);
                    state.transitions = transitions;
                }
            }
            session.nodes.remove(&node);
            session.node_intervals.remove(node);
            session.propagate(&[start, stop])
        })?;
        self.sparsify(start);
        self.sparsify(stop);
        info!(%node, %start, %stop, "node deleted");
        Ok(())
    }

    /// Every dense state from the one before `start` through `stop`, with
    /// `node` spliced out and transitions re-derived against the new trees.
    fn trees_without(
        &self,
        node: NodeId,
        start: Offset,
        stop: Offset,
    ) -> Result<Vec<(Offset, Arc<TreeShape>, Transitions)>, SessionError> {
        let first = self
            .find_state_before(start, true)
            .map_or(Offset::NEG_INFINITY, |state| state.offset);
        let mut previous: Option<Arc<TreeShape>> = None;
        let mut rebuilt = Vec::new();
        for (offset, state) in self.states.range(first..=stop) {
            let Some(tree) = state.tree.as_ref() else {
                continue;
            };
            let mut tree = Arc::clone(tree);
            if tree.contains(node) {
                Arc::make_mut(&mut tree).splice_out(node);
            }
            if let Some(one) = previous.as_ref() {
                let mut stop_nodes = state.stop_nodes.clone();
                stop_nodes.remove(&node);
                let transitions = transition::diff(one, &tree, &stop_nodes)?;
                rebuilt.push((*offset, Arc::clone(&tree), transitions));
            }
            previous = Some(tree);
        }
        Ok(rebuilt)
    }

    /// Changes a node's duration, keeping its start.
    ///
    /// Shortening splits the node and deletes the tail; with
    /// `clip_children` every child under the tail is deleted too.
    /// Lengthening moves the node out of each ancestor that would free it
    /// earlier.
    #[instrument(skip(self), fields(session_id = %self.id))]
    pub fn set_duration(
        &mut self,
        node: NodeId,
        duration: f64,
        clip_children: bool,
    ) -> Result<(), SessionError> {
        if node.is_root() {
            return Err(SessionError::RootImmutable("resized"));
        }
        if duration.is_nan() || duration <= 0.0 {
            return Err(SessionError::InvalidDuration(duration));
        }
        let target = self.node(node).ok_or(SessionError::NodeNotFound(node))?;
        let (start, old_stop) = (target.start, target.stop);
        let new_stop = start + duration;
        if new_stop == old_stop {
            return Ok(());
        }
        self.transact(|session| {
            if new_stop < old_stop {
                session.shorten(node, new_stop, clip_children)
            } else {
                session.lengthen(node, start, old_stop, new_stop)
            }
        })?;
        info!(%node, %start, %old_stop, %new_stop, "node duration changed");
        Ok(())
    }

    fn shorten(
        &mut self,
        node: NodeId,
        split: Offset,
        clip_children: bool,
    ) -> Result<(), SessionError> {
        let old_stop = self.node(node).map_or(Offset::INFINITY, Node::stop);
        self.scoped(Some(split), |session, split| {
            let twins =
                session.split_and_propagate(node, split, SplitOptions::uniform(clip_children))?;
            let Some((_, tail)) = twins.first().copied() else {
                return Ok(());
            };
            if clip_children {
                let doomed = session.tree_at(split).preorder(tail);
                for child in doomed.into_iter().rev() {
                    session.delete_node(child)?;
                }
            } else {
                session.delete_node(tail)?;
            }
            Ok(())
        })?;
        self.sparsify(old_stop);
        Ok(())
    }

    fn lengthen(
        &mut self,
        node: NodeId,
        start: Offset,
        old_stop: Offset,
        new_stop: Offset,
    ) -> Result<(), SessionError> {
        let mut parent = self.tree_before(old_stop).parent(node);
        self.retime_stop(node, new_stop);
        let mut touched = vec![start, old_stop, new_stop];
        while let Some(current) = parent {
            let Some(parent_stop) = self.node(current).map(Node::stop) else {
                break;
            };
            if parent_stop >= new_stop {
                break;
            }
            self.state_entry(parent_stop)
                .transitions
                .insert(NodeTransition::add(node, AddAction::AddBefore, current));
            touched.push(parent_stop);
            parent = self.tree_before(parent_stop).parent(current);
        }
        self.propagate(&touched)
    }

    /// Ends a node at the offset, clipping its children with it.
    pub fn free_node(&mut self, node: NodeId, offset: Option<Offset>) -> Result<(), SessionError> {
        let offset = self.resolve_offset(offset)?;
        let target = self.node(node).ok_or(SessionError::NodeNotFound(node))?;
        if offset > target.stop {
            return Err(SessionError::FreeAfterStop {
                node,
                offset,
                stop: target.stop,
            });
        }
        self.set_duration(node, offset - target.start, true)
    }
}
