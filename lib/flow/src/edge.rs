//! Edge types for flow graphs.
//!
//! An edge links a source node to a target node. Edges leaving a branching
//! node carry a source handle:
//! - MESSAGE: the button index
//! - CONDITION: the predicate index
//! - TRIGGER: the keyword partition index

use crate::node::NodeId;
use serde::{Deserialize, Serialize};

/// A directed edge in a flow graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    /// Builder-assigned edge ID.
    pub id: String,
    /// The node this edge leaves.
    pub source: NodeId,
    /// Branch selector on the source node; `None` for the unconditioned edge.
    #[serde(default)]
    pub source_handle: Option<usize>,
    /// The node this edge enters.
    pub target: NodeId,
}

impl Edge {
    /// Creates an unconditioned edge.
    #[must_use]
    pub fn new(id: impl Into<String>, source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
        }
    }

    /// Creates an edge taken when branch `handle` of the source is selected.
    #[must_use]
    pub fn branch(
        id: impl Into<String>,
        source: impl Into<NodeId>,
        handle: usize,
        target: impl Into<NodeId>,
    ) -> Self {
        Self {
            source_handle: Some(handle),
            ..Self::new(id, source, target)
        }
    }
}
