//! Flow definition types.
//!
//! A flow is an operator-authored automation scoped to one channel:
//! - Metadata (name, workspace, channel, activation, update time)
//! - The trigger rule deciding which events start it
//! - The node and edge lists produced by the builder
//!
//! A `Flow` is unvalidated. `Flow::publish` checks the graph and returns a
//! `PublishedFlow`, the only form the engine executes.

use crate::edge::Edge;
use crate::error::ValidationError;
use crate::graph::FlowGraph;
use crate::node::Node;
use crate::trigger::TriggerRule;
use chrono::{DateTime, Utc};
use replyflow_core::{FlowId, WorkspaceId};
use serde::{Deserialize, Serialize, Serializer};

/// A flow as authored in the builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flow {
    /// Unique identifier for this flow.
    pub id: FlowId,
    /// Workspace owning the flow.
    pub workspace_id: WorkspaceId,
    /// Channel the flow listens on.
    pub channel_id: String,
    /// Human-readable name.
    pub name: String,
    /// Whether new conversations may start.
    pub is_active: bool,
    /// Entry condition.
    pub trigger: TriggerRule,
    /// Graph nodes.
    pub nodes: Vec<Node>,
    /// Graph edges.
    pub edges: Vec<Edge>,
    /// Last modification time; newer flows win trigger ties.
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Creates an active flow with an empty graph.
    #[must_use]
    pub fn new(
        workspace_id: WorkspaceId,
        channel_id: impl Into<String>,
        name: impl Into<String>,
        trigger: TriggerRule,
    ) -> Self {
        Self {
            id: FlowId::new(),
            workspace_id,
            channel_id: channel_id.into(),
            name: name.into(),
            is_active: true,
            trigger,
            nodes: Vec::new(),
            edges: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Adds a node.
    #[must_use]
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Adds an edge.
    #[must_use]
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    /// Sets whether the flow is active.
    #[must_use]
    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    /// Validates the graph and produces the executable form.
    ///
    /// # Errors
    ///
    /// Returns a `ValidationError` describing the first structural problem.
    pub fn publish(self) -> Result<PublishedFlow, ValidationError> {
        let graph = FlowGraph::build(&self.nodes, &self.edges)?;
        Ok(PublishedFlow { flow: self, graph })
    }
}

/// A validated flow with its traversal graph.
///
/// Serializes as the underlying `Flow`; loading goes back through
/// `Flow::publish`.
#[derive(Debug, Clone)]
pub struct PublishedFlow {
    flow: Flow,
    graph: FlowGraph,
}

impl PublishedFlow {
    /// Returns the flow definition.
    #[must_use]
    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    /// Returns the validated graph.
    #[must_use]
    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Returns the flow ID.
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.flow.id
    }

    /// Returns whether new conversations may start.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.flow.is_active
    }

    /// Activates or deactivates the flow and bumps `updated_at`.
    pub fn set_active(&mut self, is_active: bool) {
        self.flow.is_active = is_active;
        self.flow.updated_at = Utc::now();
    }

    /// Overrides the update timestamp.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.flow.updated_at = at;
    }

    /// Consumes this value, returning the flow definition.
    #[must_use]
    pub fn into_flow(self) -> Flow {
        self.flow
    }
}

impl Serialize for PublishedFlow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.flow.serialize(serializer)
    }
}

#[cfg(test)]
impl Flow {
    /// TRIGGER followed by a single message.
    pub(crate) fn single_message(
        workspace_id: WorkspaceId,
        channel_id: &str,
        trigger: TriggerRule,
        text: &str,
    ) -> Self {
        use crate::node::MessageNode;

        Self::new(workspace_id, channel_id, "single message", trigger)
            .with_node(Node::trigger("trigger"))
            .with_node(Node::message("m1", MessageNode::text(text)))
            .with_edge(Edge::new("e1", "trigger", "m1"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::FunnelMetric;
    use crate::node::{Button, MessageNode, NodeId};
    use crate::trigger::TriggerType;

    fn bootcamp_flow() -> Flow {
        Flow::new(
            WorkspaceId::new(),
            "chan",
            "bootcamp",
            TriggerRule::specific(TriggerType::Comment, ["bootcamp"]),
        )
        .with_node(Node::trigger("t"))
        .with_node(Node::message(
            "ask",
            MessageNode::text("Want the link?")
                .with_button(Button::new("Get link").with_metric(FunnelMetric::LinkClicked))
                .with_metric(FunnelMetric::OpeningMsgSent),
        ))
        .with_node(Node::message(
            "link",
            MessageNode::text("Here: example.com/link").with_metric(FunnelMetric::LinkMsgSent),
        ))
        .with_edge(Edge::new("e1", "t", "ask"))
        .with_edge(Edge::branch("e2", "ask", 0, "link"))
    }

    #[test]
    fn publish_builds_graph() {
        let published = bootcamp_flow().publish().expect("valid");
        assert_eq!(published.graph().node_count(), 3);
        assert_eq!(
            published.graph().next(&NodeId::new("ask"), Some(0)),
            Some(&NodeId::new("link"))
        );
        assert!(published.is_active());
    }

    #[test]
    fn publish_rejects_invalid_graph() {
        let flow = bootcamp_flow().with_edge(Edge::new("e3", "link", "nowhere"));
        assert!(matches!(
            flow.publish(),
            Err(ValidationError::DanglingEdge { .. })
        ));
    }

    #[test]
    fn published_flow_serializes_as_flow() {
        let flow = bootcamp_flow();
        let published = flow.clone().publish().expect("valid");

        let json = serde_json::to_value(&published).expect("serialize");
        assert_eq!(json["isActive"], true);
        assert_eq!(json["trigger"]["triggerType"], "COMMENT");
        assert_eq!(json["trigger"]["keywordType"], "SPECIFIC");

        let parsed: Flow = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, flow);
    }

    #[test]
    fn set_active_bumps_updated_at() {
        let mut published = bootcamp_flow().publish().expect("valid");
        let before = published.flow().updated_at;
        published.set_active(false);
        assert!(!published.is_active());
        assert!(published.flow().updated_at >= before);
    }
}
