use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use proptest::prelude::*;
use rosc::{OscMessage, OscPacket, OscType};
use scoreline_core::{
    AddAction, AddGroupRequest, AddSynthRequest, IdMapping, NodeId, Offset, Session, SplitOptions,
    TreeShape,
    decode_datagram, encode_datagram, fixtures::sine_synthdef, no_dependencies,
    transition::{apply_all, diff},
};

#[derive(Debug, Clone)]
enum Op {
    Group { at: u8, length: u8, target: usize, tail: bool },
    Synth { at: u8, length: u8, target: usize, tail: bool },
    Move { node: usize, at: u8, target: usize, tail: bool },
    Split { node: usize, at: u8, children: bool },
    Delete { node: usize },
    Resize { node: usize, length: u8, clip: bool },
    Free { node: usize, at: u8 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u8..8, 1u8..6, any::<usize>(), any::<bool>())
            .prop_map(|(at, length, target, tail)| Op::Group { at, length, target, tail }),
        (0u8..8, 1u8..6, any::<usize>(), any::<bool>())
            .prop_map(|(at, length, target, tail)| Op::Synth { at, length, target, tail }),
        (any::<usize>(), 0u8..8, any::<usize>(), any::<bool>())
            .prop_map(|(node, at, target, tail)| Op::Move { node, at, target, tail }),
        (any::<usize>(), 1u8..10, any::<bool>())
            .prop_map(|(node, at, children)| Op::Split { node, at, children }),
        any::<usize>().prop_map(|node| Op::Delete { node }),
        (any::<usize>(), 1u8..8, any::<bool>())
            .prop_map(|(node, length, clip)| Op::Resize { node, length, clip }),
        (any::<usize>(), 1u8..10).prop_map(|(node, at)| Op::Free { node, at }),
    ]
}

/// Groups alive at `offset` that are in the tree there, plus the root.
fn group_targets(session: &Session, offset: Offset) -> Vec<(NodeId, Offset)> {
    let tree = session.tree_at(offset);
    let mut targets = vec![(NodeId::ROOT, Offset::INFINITY)];
    targets.extend(
        session
            .nodes()
            .filter(|node| node.is_group() && node.start() <= offset && offset < node.stop())
            .filter(|node| tree.contains(node.id()))
            .map(|node| (node.id(), node.stop())),
    );
    targets
}

fn action(tail: bool) -> AddAction {
    if tail { AddAction::AddToTail } else { AddAction::AddToHead }
}

fn pick(created: &[NodeId], index: usize) -> Option<NodeId> {
    (!created.is_empty()).then(|| created[index % created.len()])
}

/// Builds a session from `ops`, skipping any op whose target cannot hold it.
/// Children never outlive the group they are placed in.
fn build_session(ops: &[Op]) -> Session {
    let synthdef = Arc::new(sine_synthdef());
    let mut session = Session::default();
    let mut created: Vec<NodeId> = Vec::new();
    for op in ops {
        match op {
            Op::Group { at, length, target, tail } | Op::Synth { at, length, target, tail } => {
                let offset = Offset::from(f64::from(*at));
                let targets = group_targets(&session, offset);
                let (group, group_stop) = targets[*target % targets.len()];
                let duration = f64::from(*length).min(group_stop - offset);
                let result = if matches!(op, Op::Group { .. }) {
                    session.add_group(
                        AddGroupRequest::default()
                            .target(group, action(*tail))
                            .duration(duration)
                            .at(offset),
                    )
                } else {
                    session.add_synth(
                        AddSynthRequest::new(Arc::clone(&synthdef))
                            .target(group, action(*tail))
                            .duration(duration)
                            .at(offset),
                    )
                };
                if let Ok(node) = result {
                    created.push(node);
                }
            }
            Op::Move { node, at, target, tail } => {
                if created.is_empty() {
                    continue;
                }
                let node = created[*node % created.len()];
                let offset = Offset::from(f64::from(*at));
                let Some(moving) = session.node(node) else {
                    continue;
                };
                let stop = moving.stop();
                if !(moving.start() <= offset && offset < stop) {
                    continue;
                }
                if !session.tree_at(offset).contains(node) {
                    continue;
                }
                let targets: Vec<(NodeId, Offset)> = group_targets(&session, offset)
                    .into_iter()
                    .filter(|(_, group_stop)| *group_stop >= stop)
                    .collect();
                let (group, _) = targets[*target % targets.len()];
                let _ = session.move_node(node, action(*tail), group, Some(offset));
            }
            Op::Split { node, at, children } => {
                if let Some(node) = pick(&created, *node) {
                    let options = SplitOptions {
                        occupiers: *children,
                        traversers: *children,
                    };
                    let split = Some(Offset::from(f64::from(*at)));
                    if let Ok(shards) = session.split_node(node, options, split) {
                        created.extend(shards.twins.iter().map(|(_, twin)| *twin));
                    }
                }
            }
            Op::Delete { node } => {
                if let Some(node) = pick(&created, *node) {
                    let _ = session.delete_node(node);
                }
            }
            Op::Resize { node, length, clip } => {
                if let Some(node) = pick(&created, *node) {
                    let _ = session.set_duration(node, f64::from(*length), *clip);
                }
            }
            Op::Free { node, at } => {
                if let Some(node) = pick(&created, *node) {
                    let _ = session.free_node(node, Some(Offset::from(f64::from(*at))));
                }
            }
        }
    }
    session
}

/// Minimal engine-side node tree, strict about missing targets.
#[derive(Debug, Default, PartialEq, Eq)]
struct EngineTree {
    children: BTreeMap<i32, Vec<i32>>,
}

impl EngineTree {
    fn new() -> Self {
        Self {
            children: BTreeMap::from([(0, Vec::new())]),
        }
    }

    fn from_shape(shape: &TreeShape, mapping: &IdMapping) -> Self {
        let mut tree = Self::default();
        for node in shape.nodes() {
            let children = shape
                .children(node)
                .iter()
                .map(|child| mapping.node(*child).expect("tree nodes are mapped"))
                .collect();
            tree.children
                .insert(mapping.node(node).expect("tree nodes are mapped"), children);
        }
        tree
    }

    fn parent(&self, node: i32) -> Option<i32> {
        self.children
            .iter()
            .find(|(_, children)| children.contains(&node))
            .map(|(parent, _)| *parent)
    }

    fn place(&mut self, node: i32, action: i32, target: i32) -> Result<(), String> {
        if !self.children.contains_key(&target) {
            return Err(format!("target {target} missing for {node}"));
        }
        if let Some(parent) = self.parent(node) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|sibling| *sibling != node);
            }
        }
        self.children.entry(node).or_default();
        let parent = if action >= 2 {
            self.parent(target).ok_or(format!("target {target} has no parent"))?
        } else {
            target
        };
        let siblings = self.children.get_mut(&parent).ok_or("parent vanished")?;
        match action {
            0 => siblings.insert(0, node),
            1 => siblings.push(node),
            _ => {
                let index = siblings
                    .iter()
                    .position(|sibling| *sibling == target)
                    .ok_or("target is not a sibling")?;
                siblings.insert(if action == 3 { index + 1 } else { index }, node);
            }
        }
        Ok(())
    }

    fn free(&mut self, node: i32) {
        if let Some(parent) = self.parent(node) {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|sibling| *sibling != node);
            }
        }
        for child in self.children.remove(&node).unwrap_or_default() {
            self.free(child);
        }
    }

    fn apply(&mut self, message: &OscMessage) -> Result<(), String> {
        let ints: Vec<i32> = message
            .args
            .iter()
            .filter_map(|arg| match arg {
                OscType::Int(value) => Some(*value),
                _ => None,
            })
            .collect();
        match message.addr.as_str() {
            "/s_new" => self.place(ints[0], ints[1], ints[2]),
            "/g_new" => self.place(ints[0], ints[1], ints[2]),
            "/g_head" => self.place(ints[1], 0, ints[0]),
            "/g_tail" => self.place(ints[1], 1, ints[0]),
            "/n_before" => self.place(ints[0], 2, ints[1]),
            "/n_after" => self.place(ints[0], 3, ints[1]),
            "/n_free" => {
                for node in ints {
                    self.free(node);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn edit_free_states_match_the_preceding_tree(
        ops in prop::collection::vec(op_strategy(), 1..24),
    ) {
        let session = build_session(&ops);
        for state in session.states().filter(|state| state.offset().is_finite()) {
            let before = session.tree_before(state.offset());
            let here = session.tree_at(state.offset());
            let rebuilt = apply_all(&before, state.transitions(), state.stop_nodes())
                .expect("recorded transitions should apply");
            prop_assert_eq!(&rebuilt, &*here);
            if state.is_sparse() {
                prop_assert_eq!(&*before, &*here);
            }
        }
    }

    #[test]
    fn compiled_bundles_replay_to_the_declared_trees(
        ops in prop::collection::vec(op_strategy(), 1..24),
    ) {
        let session = build_session(&ops);
        prop_assume!(session.nodes().next().is_some());

        let bundles = session.to_request_bundles(None).expect("session should compile");
        let datagram = encode_datagram(&bundles, &no_dependencies).expect("bundles should encode");
        let decoded = decode_datagram(&datagram).expect("datagram should decode");
        prop_assert_eq!(decoded.len(), bundles.len());

        let mapping = IdMapping::build(&session).expect("mapping should build");
        let mut engine = EngineTree::new();
        for (bundle, compiled) in decoded.iter().zip(&bundles) {
            for packet in &bundle.content {
                if let OscPacket::Message(message) = packet {
                    prop_assert!(engine.apply(message).is_ok(), "{:?} failed", message);
                }
            }
            let expected = EngineTree::from_shape(
                &session.tree_at(Offset::from(compiled.timestamp)),
                &mapping,
            );
            prop_assert_eq!(&engine, &expected, "mismatch at {}", compiled.timestamp);
        }
    }

    #[test]
    fn diff_turns_one_arrangement_into_another(
        one_slots in prop::collection::vec((0u8..4, any::<u16>()), 1..10),
        two_slots in prop::collection::vec((0u8..4, any::<u16>()), 1..10),
        stopped in prop::collection::btree_set(0usize..10, 0..4),
    ) {
        let count = one_slots.len().min(two_slots.len());
        let stops: BTreeSet<NodeId> = stopped
            .into_iter()
            .filter(|index| *index < count)
            .map(|index| leaf(index))
            .collect();
        let one = arrangement(&one_slots[..count], &BTreeSet::new());
        let two = arrangement(&two_slots[..count], &stops);

        let transitions = diff(&one, &two, &stops).expect("diff should converge");
        let replayed = apply_all(&one, &transitions, &stops).expect("diff should apply");
        prop_assert_eq!(replayed, two);
    }
}

fn leaf(index: usize) -> NodeId {
    NodeId(10 + u32::try_from(index).expect("small index"))
}

/// Three fixed groups under the root with leaves spread among them; each
/// leaf's `(parent, key)` slot decides where it sits.
fn arrangement(slots: &[(u8, u16)], skip: &BTreeSet<NodeId>) -> TreeShape {
    let groups = [NodeId(1), NodeId(2), NodeId(3)];
    let mut members: BTreeMap<u32, Vec<(u16, NodeId)>> = BTreeMap::new();
    for (index, group) in groups.iter().enumerate() {
        let key = u16::try_from(index).expect("small index") * 1000;
        members.entry(0).or_default().push((key, *group));
    }
    for (index, (parent, key)) in slots.iter().enumerate() {
        let node = leaf(index);
        if !skip.contains(&node) {
            members.entry(u32::from(*parent)).or_default().push((*key, node));
        }
    }
    let mut transitions = Vec::new();
    for parent in [0, 1, 2, 3] {
        let Some(children) = members.get_mut(&parent) else {
            continue;
        };
        children.sort();
        for (_, child) in children.iter() {
            transitions.push(scoreline_core::NodeTransition::add(
                *child,
                AddAction::AddToTail,
                NodeId(parent),
            ));
        }
    }
    apply_all(&TreeShape::root(), &transitions, &BTreeSet::new())
        .expect("arrangement transitions should apply")
}
