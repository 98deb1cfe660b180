use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    model::NodeId,
    session::Session,
    state::State,
    time::Offset,
    transition::TreeShape,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub start: Vec<u32>,
    pub stop: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub offset: f64,
    /// Parent id to ordered child ids, for every node with children.
    pub hierarchy: BTreeMap<u32, Vec<u32>>,
    pub lifecycle: Lifecycle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub name: Option<String>,
    pub generated_at: DateTime<Utc>,
    pub duration: f64,
    pub states: Vec<StateReport>,
}

impl State {
    /// Summarises this state against `tree`, the shape in effect here.
    #[must_use]
    pub fn report(&self, tree: &TreeShape) -> StateReport {
        let hierarchy = tree
            .nodes()
            .filter(|node| !tree.children(*node).is_empty())
            .map(|node| {
                let children = tree.children(node).iter().map(|child| child.0).collect();
                (node.0, children)
            })
            .collect();
        StateReport {
            offset: self.offset.seconds(),
            hierarchy,
            lifecycle: Lifecycle {
                start: self.start_nodes.iter().map(|node| node.0).collect(),
                stop: self.stop_nodes.iter().map(|node| node.0).collect(),
            },
        }
    }
}

impl Session {
    /// Per-offset hierarchy and lifecycle, sentinels excluded.
    #[must_use]
    pub fn report(&self) -> SessionReport {
        let states = self
            .states()
            .filter(|state| state.offset().is_finite())
            .map(|state| state.report(&self.tree_at(state.offset())))
            .collect();
        SessionReport {
            session_id: self.id(),
            name: self.name().map(str::to_string),
            generated_at: Utc::now(),
            duration: self.duration(),
            states,
        }
    }

    /// Textual node trees, one per offset where the tree (or, with
    /// `include_controls`, a control value) changes.
    #[must_use]
    pub fn to_strings(&self, include_controls: bool) -> Vec<String> {
        let mut offsets: BTreeSet<Offset> = self
            .offsets()
            .into_iter()
            .filter(|offset| offset.is_finite())
            .collect();
        if include_controls {
            offsets.extend(
                self.nodes()
                    .flat_map(|node| node.events().values().flat_map(|events| events.offsets())),
            );
        }

        let mut strings = Vec::new();
        let mut previous: Option<String> = None;
        for offset in offsets {
            let tree = self.tree_at(offset);
            let body = self.render_tree(&tree, offset, include_controls);
            if previous.as_deref() == Some(body.as_str()) {
                continue;
            }
            strings.push(format!("{:?}:\n{body}", offset.seconds()));
            previous = Some(body);
        }
        strings
    }

    fn render_tree(&self, tree: &TreeShape, offset: Offset, include_controls: bool) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "    NODE TREE 0 group");
        let mut stack: Vec<(NodeId, usize)> = tree
            .children(NodeId::ROOT)
            .iter()
            .rev()
            .map(|child| (*child, 2))
            .collect();
        while let Some((node_id, depth)) = stack.pop() {
            let indent = "    ".repeat(depth);
            let label = self.node(node_id).map_or("?", |node| node.label());
            let _ = writeln!(out, "{indent}{node_id} {label}");
            if include_controls {
                if let Some(controls) = self.controls_line(node_id, offset) {
                    let _ = writeln!(out, "{indent}    {controls}");
                }
            }
            stack.extend(
                tree.children(node_id)
                    .iter()
                    .rev()
                    .map(|child| (*child, depth + 1)),
            );
        }
        out
    }

    fn controls_line(&self, node_id: NodeId, offset: Offset) -> Option<String> {
        let synthdef = self.node(node_id)?.synthdef()?;
        let controls: Vec<String> = synthdef
            .parameters()
            .iter()
            .filter_map(|parameter| {
                let value = self.param(node_id, &parameter.name, Some(offset)).ok()??;
                Some(format!("{}: {value}", parameter.name))
            })
            .collect();
        if controls.is_empty() {
            None
        } else {
            Some(controls.join(", "))
        }
    }
}
