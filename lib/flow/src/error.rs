//! Error types for the flow crate.
//!
//! `ValidationError` is raised when a flow is published. A flow that fails
//! validation is rejected and never becomes active.

use crate::node::{NodeId, NodeKindTag};
use std::fmt;

/// A structural problem found while publishing a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The flow has no TRIGGER node.
    MissingTrigger,
    /// The flow has more than one TRIGGER node.
    MultipleTriggers { node_ids: Vec<NodeId> },
    /// Two nodes share an ID.
    DuplicateNodeId { node_id: NodeId },
    /// An edge references a node that does not exist.
    DanglingEdge { edge_id: String, node_id: NodeId },
    /// More than one edge leaves the same node through the same handle.
    DuplicateBranch {
        node_id: NodeId,
        handle: Option<usize>,
    },
    /// A node cannot be reached from the TRIGGER node.
    UnreachableNode { node_id: NodeId },
    /// Non-CONDITION nodes form a cycle.
    CycleDetected { node_id: NodeId },
    /// The TRIGGER node has several outgoing edges but no keyword partitions.
    UnpartitionedTrigger { edge_count: usize },
    /// An edge handle exceeds the branches its source node declares.
    HandleOutOfRange {
        node_id: NodeId,
        handle: usize,
        branch_count: usize,
    },
    /// An edge carries a handle but its source node does not branch.
    UnexpectedHandle { node_id: NodeId, kind: NodeKindTag },
    /// A message declares both buttons and a free-text capture.
    ButtonsWithCapture { node_id: NodeId },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTrigger => write!(f, "flow has no TRIGGER node"),
            Self::MultipleTriggers { node_ids } => {
                let ids: Vec<_> = node_ids.iter().map(NodeId::as_str).collect();
                write!(f, "flow has multiple TRIGGER nodes: {}", ids.join(", "))
            }
            Self::DuplicateNodeId { node_id } => {
                write!(f, "duplicate node id: {node_id}")
            }
            Self::DanglingEdge { edge_id, node_id } => {
                write!(f, "edge {edge_id} references missing node {node_id}")
            }
            Self::DuplicateBranch { node_id, handle } => match handle {
                Some(handle) => write!(
                    f,
                    "node {node_id} has more than one edge for handle {handle}"
                ),
                None => write!(f, "node {node_id} has more than one unconditioned edge"),
            },
            Self::UnreachableNode { node_id } => {
                write!(f, "node {node_id} is unreachable from the trigger")
            }
            Self::CycleDetected { node_id } => {
                write!(f, "cycle through non-condition node {node_id}")
            }
            Self::UnpartitionedTrigger { edge_count } => write!(
                f,
                "trigger has {edge_count} outgoing edges but no keyword partitions"
            ),
            Self::HandleOutOfRange {
                node_id,
                handle,
                branch_count,
            } => write!(
                f,
                "edge handle {handle} out of range for node {node_id} ({branch_count} branches)"
            ),
            Self::UnexpectedHandle { node_id, kind } => {
                write!(f, "{kind} node {node_id} does not accept edge handles")
            }
            Self::ButtonsWithCapture { node_id } => {
                write!(f, "message {node_id} has both buttons and a reply capture")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dangling_edge_display() {
        let err = ValidationError::DanglingEdge {
            edge_id: "e1".to_string(),
            node_id: NodeId::new("ghost"),
        };
        assert_eq!(err.to_string(), "edge e1 references missing node ghost");
    }

    #[test]
    fn duplicate_branch_display() {
        let err = ValidationError::DuplicateBranch {
            node_id: NodeId::new("m1"),
            handle: Some(0),
        };
        assert!(err.to_string().contains("handle 0"));

        let err = ValidationError::DuplicateBranch {
            node_id: NodeId::new("m1"),
            handle: None,
        };
        assert!(err.to_string().contains("unconditioned"));
    }

    #[test]
    fn multiple_triggers_lists_ids() {
        let err = ValidationError::MultipleTriggers {
            node_ids: vec![NodeId::new("t1"), NodeId::new("t2")],
        };
        assert!(err.to_string().ends_with("t1, t2"));
    }
}
