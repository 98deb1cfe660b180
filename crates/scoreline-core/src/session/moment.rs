use std::ops::{Deref, DerefMut};

use tracing::error;

use super::{Session, SessionError};
use crate::time::Offset;

/// A scoped cursor at one offset.
///
/// Session methods called through a moment default to its offset. Leaving
/// the scope re-propagates the offset and drops its state again if nothing
/// was recorded there. Dropping an unclosed moment only logs an exit
/// error; use [`Moment::close`] to handle it.
#[derive(Debug)]
pub struct Moment<'a> {
    session: &'a mut Session,
    offset: Offset,
    propagate: bool,
    closed: bool,
}

impl<'a> Moment<'a> {
    pub(super) fn new(session: &'a mut Session, offset: Offset, propagate: bool) -> Self {
        Self {
            session,
            offset,
            propagate,
            closed: false,
        }
    }

    #[must_use]
    pub fn offset(&self) -> Offset {
        self.offset
    }

    #[must_use]
    pub fn propagates(&self) -> bool {
        self.propagate
    }

    pub fn close(mut self) -> Result<(), SessionError> {
        self.closed = true;
        self.session.exit_moment()
    }
}

impl Deref for Moment<'_> {
    type Target = Session;

    fn deref(&self) -> &Self::Target {
        self.session
    }
}

impl DerefMut for Moment<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
    }
}

impl Drop for Moment<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(error) = self.session.exit_moment() {
            error!(offset = %self.offset, %error, "moment exit failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        model::{AddAction, NodeId},
        session::{AddGroupRequest, Session},
        time::Offset,
    };

    #[test]
    fn nested_moments_restore_the_outer_offset() {
        let mut session = Session::default();
        let mut outer = session.at(1.0).expect("outer moment should open");
        {
            let inner = outer.at(2.0).expect("inner moment should open");
            assert_eq!(inner.active_offset(), Some(Offset::from(2.0)));
        }
        assert_eq!(outer.active_offset(), Some(Offset::from(1.0)));
        outer.close().expect("outer moment should close");
        assert!(session.active_offset().is_none());
    }

    #[test]
    fn operations_default_to_the_moment_offset() {
        let mut session = Session::default();
        let mut moment = session.at(4.0).expect("moment should open");
        let group = moment
            .add_group(AddGroupRequest::default())
            .expect("group should be added");
        moment.close().expect("moment should close");

        let node = session.node(group).expect("group should exist");
        assert_eq!(node.start(), Offset::from(4.0));
        assert_eq!(
            session.tree_at(Offset::from(4.0)).children(NodeId::ROOT),
            &[group]
        );
    }

    #[test]
    fn dropping_a_moment_after_regrouping_keeps_the_edits() {
        let mut session = Session::default();
        let (outer, inner) = {
            let mut moment = session.at(3.0).expect("moment should open");
            let outer = moment
                .add_group(AddGroupRequest::default().target(NodeId::ROOT, AddAction::AddToTail))
                .expect("outer group");
            let inner = moment
                .add_group(AddGroupRequest::default().target(outer, AddAction::AddToTail))
                .expect("inner group");
            moment
                .move_node(outer, AddAction::AddToTail, NodeId::ROOT, None)
                .expect("move should succeed");
            (outer, inner)
        };

        assert!(session.active_offset().is_none());
        let tree = session.tree_at(Offset::from(3.0));
        assert_eq!(tree.children(NodeId::ROOT), &[outer]);
        assert_eq!(tree.children(outer), &[inner]);
    }

    #[test]
    fn moments_without_propagation_defer_tree_updates() {
        let mut session = Session::default();
        let moment = session
            .at_without_propagation(1.0)
            .expect("moment should open");
        assert!(!moment.propagates());
        moment.close().expect("moment should close");
        assert!(session.state_at(Offset::from(1.0)).is_none());
    }
}
