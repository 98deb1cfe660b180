use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{AddAction, NodeId};

pub const MAX_RECONCILIATION_ROUNDS: usize = 100;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransitionError {
    #[error("transition target not in tree: {0}")]
    TargetMissing(NodeId),
    #[error("transition target {0} has no parent to add beside")]
    TargetHasNoParent(NodeId),
    #[error("transition target {target} is not a child of {parent}")]
    TargetNotSibling { target: NodeId, parent: NodeId },
    #[error("tree reconciliation did not converge after {0} rounds")]
    ReconciliationDiverged(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    Add { action: AddAction, target: NodeId },
    Free,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTransition {
    pub source: NodeId,
    pub action: NodeAction,
}

impl NodeTransition {
    #[must_use]
    pub fn add(source: NodeId, action: AddAction, target: NodeId) -> Self {
        Self {
            source,
            action: NodeAction::Add { action, target },
        }
    }

    #[must_use]
    pub fn free(source: NodeId) -> Self {
        Self {
            source,
            action: NodeAction::Free,
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<NodeId> {
        match self.action {
            NodeAction::Add { target, .. } => Some(target),
            NodeAction::Free => None,
        }
    }

    #[must_use]
    pub fn with_source(self, source: NodeId) -> Self {
        Self { source, ..self }
    }

    #[must_use]
    pub fn with_target(self, new_target: NodeId) -> Self {
        match self.action {
            NodeAction::Add { action, .. } => Self::add(self.source, action, new_target),
            NodeAction::Free => self,
        }
    }
}

/// Transitions keyed by source node, kept in insertion order.
///
/// Re-inserting an existing source replaces its transition in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transitions {
    entries: Vec<NodeTransition>,
}

impl Transitions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, transition: NodeTransition) -> Option<NodeTransition> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|existing| existing.source == transition.source)
        {
            return Some(std::mem::replace(existing, transition));
        }
        self.entries.push(transition);
        None
    }

    pub fn remove(&mut self, source: NodeId) -> Option<NodeTransition> {
        let index = self
            .entries
            .iter()
            .position(|transition| transition.source == source)?;
        Some(self.entries.remove(index))
    }

    #[must_use]
    pub fn get(&self, source: NodeId) -> Option<&NodeTransition> {
        self.entries
            .iter()
            .find(|transition| transition.source == source)
    }

    #[must_use]
    pub fn contains(&self, source: NodeId) -> bool {
        self.get(source).is_some()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeTransition> {
        self.entries.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, NodeTransition> {
        self.entries.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Transitions {
    type Item = &'a NodeTransition;
    type IntoIter = std::slice::Iter<'a, NodeTransition>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

impl IntoIterator for Transitions {
    type Item = NodeTransition;
    type IntoIter = std::vec::IntoIter<NodeTransition>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl FromIterator<NodeTransition> for Transitions {
    fn from_iter<I: IntoIterator<Item = NodeTransition>>(iter: I) -> Self {
        let mut transitions = Self::new();
        for transition in iter {
            transitions.insert(transition);
        }
        transitions
    }
}

/// Tree shape: ordered child lists plus the inverse parent map.
///
/// Every node in the tree has a children entry, leaves included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeShape {
    children: BTreeMap<NodeId, Vec<NodeId>>,
    parents: BTreeMap<NodeId, NodeId>,
}

impl Default for TreeShape {
    fn default() -> Self {
        Self::root()
    }
}

impl TreeShape {
    #[must_use]
    pub fn root() -> Self {
        Self {
            children: BTreeMap::from([(NodeId::ROOT, Vec::new())]),
            parents: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn contains(&self, node: NodeId) -> bool {
        self.children.contains_key(&node)
    }

    #[must_use]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        self.children.get(&node).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.parents.get(&node).copied()
    }

    /// The node followed by its ancestors up to the root.
    #[must_use]
    pub fn parentage(&self, node: NodeId) -> Vec<NodeId> {
        let mut parentage = vec![node];
        let mut current = node;
        while let Some(parent) = self.parent(current) {
            parentage.push(parent);
            current = parent;
        }
        parentage
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.keys().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Depth-first, parents before children, starting at `from`.
    #[must_use]
    pub fn preorder(&self, from: NodeId) -> Vec<NodeId> {
        let mut order = Vec::new();
        if !self.contains(from) {
            return order;
        }
        let mut stack = vec![from];
        while let Some(node) = stack.pop() {
            order.push(node);
            stack.extend(self.children(node).iter().rev());
        }
        order
    }

    pub fn apply(&mut self, transition: &NodeTransition) -> Result<(), TransitionError> {
        match transition.action {
            NodeAction::Free => {
                self.free(transition.source);
                Ok(())
            }
            NodeAction::Add { action, target } => self.move_node(transition.source, action, target),
        }
    }

    /// Frees the subtree rooted at `node`; absent nodes are ignored.
    pub fn free(&mut self, node: NodeId) {
        for child in self.children.remove(&node).unwrap_or_default() {
            self.free(child);
        }
        if let Some(parent) = self.parents.remove(&node) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|sibling| *sibling != node);
            }
        }
    }

    fn move_node(
        &mut self,
        source: NodeId,
        action: AddAction,
        target: NodeId,
    ) -> Result<(), TransitionError> {
        if !self.contains(target) {
            return Err(TransitionError::TargetMissing(target));
        }
        self.children.entry(source).or_default();
        if let Some(old_parent) = self.parents.remove(&source) {
            if let Some(siblings) = self.children.get_mut(&old_parent) {
                siblings.retain(|sibling| *sibling != source);
            }
        }
        let parent = if action.is_sibling() {
            self.parent(target)
                .ok_or(TransitionError::TargetHasNoParent(target))?
        } else {
            target
        };
        let siblings = self
            .children
            .get_mut(&parent)
            .ok_or(TransitionError::TargetMissing(parent))?;
        match action {
            AddAction::AddToHead => siblings.insert(0, source),
            AddAction::AddToTail => siblings.push(source),
            AddAction::AddBefore | AddAction::AddAfter => {
                let index = siblings
                    .iter()
                    .position(|sibling| *sibling == target)
                    .ok_or(TransitionError::TargetNotSibling { target, parent })?;
                let index = if action == AddAction::AddAfter {
                    index + 1
                } else {
                    index
                };
                siblings.insert(index, source);
            }
        }
        self.parents.insert(source, parent);
        Ok(())
    }

    /// Removes `node` and puts its children where it stood in its parent's list.
    pub(crate) fn splice_out(&mut self, node: NodeId) {
        let Some(parent) = self.parents.remove(&node) else {
            return;
        };
        let inner = self.children.remove(&node).unwrap_or_default();
        for child in &inner {
            self.parents.insert(*child, parent);
        }
        if let Some(siblings) = self.children.get_mut(&parent) {
            if let Some(index) = siblings.iter().position(|sibling| *sibling == node) {
                siblings.splice(index..=index, inner);
            }
        }
    }
}

/// Applies `transitions` in order, then frees every node in `stop_nodes`.
pub fn apply_all<'a>(
    shape: &TreeShape,
    transitions: impl IntoIterator<Item = &'a NodeTransition>,
    stop_nodes: &BTreeSet<NodeId>,
) -> Result<TreeShape, TransitionError> {
    let mut shape = shape.clone();
    for transition in transitions {
        shape.apply(transition)?;
    }
    for node in stop_nodes {
        shape.free(*node);
    }
    Ok(shape)
}

/// Rebuilds the transitions that turn `one` into `two`, with `stop_nodes`
/// freed after the structural edits.
pub fn diff(
    one: &TreeShape,
    two: &TreeShape,
    stop_nodes: &BTreeSet<NodeId>,
) -> Result<Transitions, TransitionError> {
    let mut transitions = Transitions::new();
    let mut working = apply_all(one, &transitions, stop_nodes)?;
    let mut rounds = 0;
    while working != *two {
        if let Some(transition) = first_inconsistency(&working, two, stop_nodes) {
            transitions.insert(transition);
        }
        working = apply_all(one, &transitions, stop_nodes)?;
        rounds += 1;
        if rounds == MAX_RECONCILIATION_ROUNDS {
            return Err(TransitionError::ReconciliationDiverged(rounds));
        }
    }
    Ok(transitions)
}

fn first_inconsistency(
    working: &TreeShape,
    two: &TreeShape,
    stop_nodes: &BTreeSet<NodeId>,
) -> Option<NodeTransition> {
    for parent in working.preorder(NodeId::ROOT) {
        if stop_nodes.contains(&parent) {
            continue;
        }
        let current: Vec<NodeId> = working
            .children(parent)
            .iter()
            .copied()
            .filter(|child| !stop_nodes.contains(child))
            .collect();
        let expected = two.children(parent);
        if current == expected || expected.is_empty() {
            continue;
        }
        for (index, child) in expected.iter().enumerate() {
            let (action, target) = if current.is_empty() {
                (AddAction::AddToHead, parent)
            } else if current.len() <= index {
                (AddAction::AddAfter, current[index - 1])
            } else if current[index] != *child {
                (AddAction::AddBefore, current[index])
            } else {
                continue;
            };
            return Some(NodeTransition::add(*child, action, target));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(id: u32) -> NodeId {
        NodeId(id)
    }

    fn build(transitions: &[NodeTransition]) -> TreeShape {
        apply_all(&TreeShape::root(), transitions, &BTreeSet::new())
            .expect("fixture transitions should apply")
    }

    #[test]
    fn add_actions_place_nodes_relative_to_target() {
        let shape = build(&[
            NodeTransition::add(n(1000), AddAction::AddToHead, NodeId::ROOT),
            NodeTransition::add(n(1001), AddAction::AddToTail, NodeId::ROOT),
            NodeTransition::add(n(1002), AddAction::AddBefore, n(1001)),
            NodeTransition::add(n(1003), AddAction::AddAfter, n(1000)),
            NodeTransition::add(n(1004), AddAction::AddToHead, n(1000)),
        ]);
        assert_eq!(
            shape.children(NodeId::ROOT),
            &[n(1000), n(1003), n(1002), n(1001)]
        );
        assert_eq!(shape.children(n(1000)), &[n(1004)]);
        assert_eq!(shape.parent(n(1004)), Some(n(1000)));
        assert_eq!(shape.parentage(n(1004)), vec![n(1004), n(1000), NodeId::ROOT]);
    }

    #[test]
    fn free_removes_the_whole_subtree() {
        let mut shape = build(&[
            NodeTransition::add(n(1000), AddAction::AddToHead, NodeId::ROOT),
            NodeTransition::add(n(1001), AddAction::AddToHead, n(1000)),
            NodeTransition::add(n(1002), AddAction::AddToTail, n(1001)),
        ]);
        shape
            .apply(&NodeTransition::free(n(1000)))
            .expect("free should apply");
        assert_eq!(shape, TreeShape::root());
    }

    #[test]
    fn moving_relative_to_a_missing_target_is_rejected() {
        let mut shape = TreeShape::root();
        let error = shape
            .apply(&NodeTransition::add(n(1000), AddAction::AddToHead, n(9999)))
            .expect_err("missing target should fail");
        assert_eq!(error, TransitionError::TargetMissing(n(9999)));

        let error = shape
            .apply(&NodeTransition::add(n(1000), AddAction::AddBefore, NodeId::ROOT))
            .expect_err("root has no siblings");
        assert_eq!(error, TransitionError::TargetHasNoParent(NodeId::ROOT));
    }

    #[test]
    fn diff_reproduces_target_shape() {
        let one = build(&[
            NodeTransition::add(n(1000), AddAction::AddToHead, NodeId::ROOT),
            NodeTransition::add(n(1001), AddAction::AddToTail, NodeId::ROOT),
            NodeTransition::add(n(1002), AddAction::AddToTail, NodeId::ROOT),
        ]);
        let mut two = one.clone();
        for transition in [
            NodeTransition::add(n(1002), AddAction::AddToHead, NodeId::ROOT),
            NodeTransition::add(n(1003), AddAction::AddToHead, n(1001)),
            NodeTransition::add(n(1000), AddAction::AddToTail, n(1001)),
        ] {
            two.apply(&transition).expect("edit should apply");
        }

        let transitions = diff(&one, &two, &BTreeSet::new()).expect("diff should converge");
        let rebuilt = apply_all(&one, &transitions, &BTreeSet::new()).expect("replay should apply");
        assert_eq!(rebuilt, two);
    }

    #[test]
    fn diff_ignores_stop_nodes() {
        let one = build(&[
            NodeTransition::add(n(1000), AddAction::AddToHead, NodeId::ROOT),
            NodeTransition::add(n(1001), AddAction::AddToTail, NodeId::ROOT),
        ]);
        let stop_nodes = BTreeSet::from([n(1000)]);
        let mut two = one.clone();
        two.free(n(1000));

        let transitions = diff(&one, &two, &stop_nodes).expect("diff should converge");
        assert!(transitions.is_empty());
    }

    #[test]
    fn diff_aborts_when_shapes_cannot_be_reconciled() {
        let one = build(&[NodeTransition::add(n(1000), AddAction::AddToHead, NodeId::ROOT)]);
        let two = TreeShape::root();

        let error = diff(&one, &two, &BTreeSet::new()).expect_err("removal needs a stop node");
        assert_eq!(
            error,
            TransitionError::ReconciliationDiverged(MAX_RECONCILIATION_ROUNDS)
        );
    }

    #[test]
    fn splice_out_promotes_children_in_order() {
        let mut shape = build(&[
            NodeTransition::add(n(1000), AddAction::AddToHead, NodeId::ROOT),
            NodeTransition::add(n(1001), AddAction::AddToTail, NodeId::ROOT),
            NodeTransition::add(n(1002), AddAction::AddToTail, n(1000)),
            NodeTransition::add(n(1003), AddAction::AddToTail, n(1000)),
        ]);
        shape.splice_out(n(1000));
        assert_eq!(shape.children(NodeId::ROOT), &[n(1002), n(1003), n(1001)]);
        assert_eq!(shape.parent(n(1003)), Some(NodeId::ROOT));
        assert!(!shape.contains(n(1000)));
    }

    #[test]
    fn reinserting_a_transition_keeps_its_position() {
        let mut transitions = Transitions::new();
        transitions.insert(NodeTransition::add(n(1), AddAction::AddToHead, NodeId::ROOT));
        transitions.insert(NodeTransition::add(n(2), AddAction::AddToHead, NodeId::ROOT));
        transitions.insert(NodeTransition::add(n(1), AddAction::AddToTail, NodeId::ROOT));
        let sources: Vec<_> = transitions.iter().map(|transition| transition.source).collect();
        assert_eq!(sources, vec![n(1), n(2)]);
        assert_eq!(
            transitions.get(n(1)).map(|transition| transition.action),
            Some(NodeAction::Add {
                action: AddAction::AddToTail,
                target: NodeId::ROOT
            })
        );
    }
}
