use std::{collections::BTreeSet, sync::Arc};

use crate::{
    model::{BufferId, NodeId},
    time::Offset,
    transition::{Transitions, TreeShape},
};

/// Tree shape and structural edits effective from one offset onward.
///
/// `tree` is `None` while the state is sparse; a dense state may share its
/// shape with its neighbours until one of them is edited.
#[derive(Debug, Clone)]
pub struct State {
    pub(crate) offset: Offset,
    pub(crate) tree: Option<Arc<TreeShape>>,
    pub(crate) transitions: Transitions,
    pub(crate) start_nodes: BTreeSet<NodeId>,
    pub(crate) stop_nodes: BTreeSet<NodeId>,
    pub(crate) start_buffers: BTreeSet<BufferId>,
    pub(crate) stop_buffers: BTreeSet<BufferId>,
}

impl State {
    #[must_use]
    pub fn new(offset: Offset) -> Self {
        Self {
            offset,
            tree: None,
            transitions: Transitions::new(),
            start_nodes: BTreeSet::new(),
            stop_nodes: BTreeSet::new(),
            start_buffers: BTreeSet::new(),
            stop_buffers: BTreeSet::new(),
        }
    }

    pub(crate) fn with_tree(offset: Offset, tree: Arc<TreeShape>) -> Self {
        Self {
            tree: Some(tree),
            ..Self::new(offset)
        }
    }

    #[must_use]
    pub fn offset(&self) -> Offset {
        self.offset
    }

    #[must_use]
    pub fn tree(&self) -> Option<&TreeShape> {
        self.tree.as_deref()
    }

    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.tree.is_some()
    }

    /// True when the state carries no edits of its own.
    #[must_use]
    pub fn is_sparse(&self) -> bool {
        self.transitions.is_empty()
            && self.start_nodes.is_empty()
            && self.stop_nodes.is_empty()
            && self.start_buffers.is_empty()
            && self.stop_buffers.is_empty()
    }

    #[must_use]
    pub fn transitions(&self) -> &Transitions {
        &self.transitions
    }

    #[must_use]
    pub fn start_nodes(&self) -> &BTreeSet<NodeId> {
        &self.start_nodes
    }

    #[must_use]
    pub fn stop_nodes(&self) -> &BTreeSet<NodeId> {
        &self.stop_nodes
    }

    #[must_use]
    pub fn start_buffers(&self) -> &BTreeSet<BufferId> {
        &self.start_buffers
    }

    #[must_use]
    pub fn stop_buffers(&self) -> &BTreeSet<BufferId> {
        &self.stop_buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::AddAction, transition::NodeTransition};

    #[test]
    fn fresh_states_are_sparse_until_edited() {
        let mut state = State::new(Offset::from(1.0));
        assert!(state.is_sparse());
        assert!(!state.is_dense());

        state.transitions.insert(NodeTransition::add(
            NodeId(1000),
            AddAction::AddToHead,
            NodeId::ROOT,
        ));
        assert!(!state.is_sparse());
    }
}
