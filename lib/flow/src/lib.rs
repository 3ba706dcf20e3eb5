//! Flow model for replyflow.
//!
//! This crate holds everything known about a flow before any conversation
//! runs it:
//!
//! - **Nodes and edges**: the builder's graph, with kind-specific payloads
//! - **Graph**: publish-time validation and the adjacency table used for traversal
//! - **Triggers**: event types, keyword rules, and single-winner flow selection
//! - **Metrics**: funnel milestone names

pub mod definition;
pub mod edge;
pub mod error;
pub mod graph;
pub mod metric;
pub mod node;
pub mod trigger;

pub use definition::{Flow, PublishedFlow};
pub use edge::Edge;
pub use error::ValidationError;
pub use graph::FlowGraph;
pub use metric::FunnelMetric;
pub use node::{
    ActionKind, ActionNode, Button, Capture, ConditionNode, DelayNode, KeywordBranch,
    MessageNode, Node, NodeId, NodeKind, NodeKindTag, Predicate, TriggerNode, render_template,
};
pub use trigger::{InboundEvent, KeywordType, TriggerMatcher, TriggerRule, TriggerType};
