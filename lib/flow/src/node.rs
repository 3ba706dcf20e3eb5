//! Flow node types.
//!
//! Nodes are the steps of a flow. Each node has:
//! - An ID unique within the flow (assigned by the flow builder)
//! - An optional display name
//! - A kind, carrying the kind-specific payload

use crate::metric::FunnelMetric;
use crate::trigger::keywords_match;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a node within a flow.
///
/// Node IDs come from the flow builder and are only unique within their flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from the builder's string ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The kind of a node, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKindTag {
    Trigger,
    Message,
    Action,
    Condition,
    Delay,
}

impl fmt::Display for NodeKindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trigger => "TRIGGER",
            Self::Message => "MESSAGE",
            Self::Action => "ACTION",
            Self::Condition => "CONDITION",
            Self::Delay => "DELAY",
        };
        f.write_str(name)
    }
}

/// A keyword set routing the trigger to one of its outgoing edges.
///
/// Branch `i` of a trigger node is followed through the edge whose source
/// handle is `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordBranch {
    /// Keywords matched case-insensitively as substrings of the trigger text.
    pub keywords: Vec<String>,
}

/// Payload of the single TRIGGER node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerNode {
    /// Keyword partitions; empty when the trigger has a single outgoing edge.
    #[serde(default)]
    pub keyword_branches: Vec<KeywordBranch>,
}

impl TriggerNode {
    /// Returns the index of the first declared branch matching `text`.
    #[must_use]
    pub fn matching_branch(&self, text: Option<&str>) -> Option<usize> {
        let text = text?;
        self.keyword_branches
            .iter()
            .position(|branch| keywords_match(&branch.keywords, text))
    }
}

/// A quick-reply button on a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Button {
    /// Label shown to the user.
    pub label: String,
    /// Optional link opened by the button.
    #[serde(default)]
    pub url: Option<String>,
    /// Metric recorded when the user taps this button.
    #[serde(default)]
    pub metric: Option<FunnelMetric>,
}

impl Button {
    /// Creates a plain postback button.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: None,
            metric: None,
        }
    }

    /// Tags the button with a funnel metric.
    #[must_use]
    pub fn with_metric(mut self, metric: FunnelMetric) -> Self {
        self.metric = Some(metric);
        self
    }
}

/// Free-text capture: the message waits for a reply stored in a variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capture {
    /// Variable receiving the user's reply.
    pub variable: String,
    /// Metric recorded when the reply arrives.
    #[serde(default)]
    pub metric: Option<FunnelMetric>,
}

/// Payload of a MESSAGE node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageNode {
    /// Message text; `{{name}}` placeholders are filled from variables.
    pub text: String,
    /// Buttons; each one is a branch point keyed by its index.
    #[serde(default)]
    pub buttons: Vec<Button>,
    /// Optional free-text capture.
    #[serde(default)]
    pub capture: Option<Capture>,
    /// Metric recorded when the message is sent.
    #[serde(default)]
    pub metric: Option<FunnelMetric>,
}

impl MessageNode {
    /// Creates a plain text message.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
            capture: None,
            metric: None,
        }
    }

    /// Adds a button.
    #[must_use]
    pub fn with_button(mut self, button: Button) -> Self {
        self.buttons.push(button);
        self
    }

    /// Waits for a free-text reply stored in `variable`.
    #[must_use]
    pub fn with_capture(mut self, variable: impl Into<String>, metric: Option<FunnelMetric>) -> Self {
        self.capture = Some(Capture {
            variable: variable.into(),
            metric,
        });
        self
    }

    /// Tags the message with a funnel metric.
    #[must_use]
    pub fn with_metric(mut self, metric: FunnelMetric) -> Self {
        self.metric = Some(metric);
        self
    }
}

/// The side effect performed by an ACTION node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    /// Post a public reply under the triggering comment.
    ReplyToComment { text: String },
    /// Send a direct message without buttons.
    SendDirectMessage { text: String },
    /// Set a conversation variable; no outbound call.
    SetVariable { name: String, value: String },
}

/// Payload of an ACTION node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionNode {
    /// What the action does.
    pub action: ActionKind,
    /// Metric recorded when the action succeeds.
    #[serde(default)]
    pub metric: Option<FunnelMetric>,
}

/// A predicate over collected conversation variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    /// Variable equals the value exactly.
    Equals { variable: String, value: String },
    /// Variable contains the value, ignoring case.
    Contains { variable: String, value: String },
    /// Variable is set.
    Exists { variable: String },
    /// Variable is not set.
    Missing { variable: String },
    /// Always true; used as a fallback branch.
    Always,
}

impl Predicate {
    /// Evaluates the predicate against the given variables.
    #[must_use]
    pub fn evaluate(&self, variables: &BTreeMap<String, String>) -> bool {
        match self {
            Self::Equals { variable, value } => variables.get(variable) == Some(value),
            Self::Contains { variable, value } => variables
                .get(variable)
                .is_some_and(|v| v.to_lowercase().contains(&value.to_lowercase())),
            Self::Exists { variable } => variables.contains_key(variable),
            Self::Missing { variable } => !variables.contains_key(variable),
            Self::Always => true,
        }
    }
}

/// Payload of a CONDITION node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionNode {
    /// Predicates in declaration order; branch `i` uses edge handle `i`.
    pub branches: Vec<Predicate>,
}

impl ConditionNode {
    /// Returns the index of the first predicate that holds.
    #[must_use]
    pub fn first_match(&self, variables: &BTreeMap<String, String>) -> Option<usize> {
        self.branches.iter().position(|p| p.evaluate(variables))
    }
}

/// Payload of a DELAY node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayNode {
    /// Delay before continuing, in seconds.
    pub seconds: u64,
}

/// Node kind with its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Trigger(TriggerNode),
    Message(MessageNode),
    Action(ActionNode),
    Condition(ConditionNode),
    Delay(DelayNode),
}

impl NodeKind {
    /// Returns the kind tag.
    #[must_use]
    pub fn tag(&self) -> NodeKindTag {
        match self {
            Self::Trigger(_) => NodeKindTag::Trigger,
            Self::Message(_) => NodeKindTag::Message,
            Self::Action(_) => NodeKindTag::Action,
            Self::Condition(_) => NodeKindTag::Condition,
            Self::Delay(_) => NodeKindTag::Delay,
        }
    }

    /// Number of handled outgoing branches this node declares.
    ///
    /// Edges leaving the node with a source handle must use an index below
    /// this count.
    #[must_use]
    pub fn branch_count(&self) -> usize {
        match self {
            Self::Trigger(t) => t.keyword_branches.len(),
            Self::Message(m) => m.buttons.len(),
            Self::Condition(c) => c.branches.len(),
            Self::Action(_) | Self::Delay(_) => 0,
        }
    }
}

/// A flow node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Identifier unique within the flow.
    pub id: NodeId,
    /// Optional display name from the builder.
    #[serde(default)]
    pub name: Option<String>,
    /// Kind and payload.
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    /// Creates a node.
    #[must_use]
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            name: None,
            kind,
        }
    }

    /// Creates a TRIGGER node with no keyword partitions.
    #[must_use]
    pub fn trigger(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeKind::Trigger(TriggerNode::default()))
    }

    /// Creates a MESSAGE node.
    #[must_use]
    pub fn message(id: impl Into<NodeId>, message: MessageNode) -> Self {
        Self::new(id, NodeKind::Message(message))
    }

    /// Creates an ACTION node.
    #[must_use]
    pub fn action(id: impl Into<NodeId>, action: ActionKind) -> Self {
        Self::new(
            id,
            NodeKind::Action(ActionNode {
                action,
                metric: None,
            }),
        )
    }

    /// Creates a CONDITION node.
    #[must_use]
    pub fn condition(id: impl Into<NodeId>, branches: Vec<Predicate>) -> Self {
        Self::new(id, NodeKind::Condition(ConditionNode { branches }))
    }

    /// Creates a DELAY node.
    #[must_use]
    pub fn delay(id: impl Into<NodeId>, seconds: u64) -> Self {
        Self::new(id, NodeKind::Delay(DelayNode { seconds }))
    }

    /// Returns the kind tag.
    #[must_use]
    pub fn tag(&self) -> NodeKindTag {
        self.kind.tag()
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Fills `{{name}}` placeholders from `variables`.
///
/// Unknown placeholders render as empty strings.
#[must_use]
pub fn render_template(template: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let name = after[..end].trim();
        if let Some(value) = variables.get(name) {
            out.push_str(value);
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn node_serde_uses_kind_tag() {
        let node = Node::message(
            "m1",
            MessageNode::text("Want the link?").with_button(Button::new("Get link")),
        );
        let json = serde_json::to_value(&node).expect("serialize");
        assert_eq!(json["kind"], "MESSAGE");
        assert_eq!(json["id"], "m1");
        assert_eq!(json["buttons"][0]["label"], "Get link");

        let parsed: Node = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, node);
    }

    #[test]
    fn builder_json_parses() {
        let json = serde_json::json!({
            "id": "c1",
            "kind": "CONDITION",
            "branches": [
                { "op": "exists", "variable": "email" },
                { "op": "always" }
            ]
        });
        let node: Node = serde_json::from_value(json).expect("deserialize");
        assert_eq!(node.tag(), NodeKindTag::Condition);
        assert_eq!(node.kind.branch_count(), 2);
    }

    #[test]
    fn predicates_evaluate_in_declaration_order() {
        let condition = ConditionNode {
            branches: vec![
                Predicate::Equals {
                    variable: "plan".to_string(),
                    value: "pro".to_string(),
                },
                Predicate::Contains {
                    variable: "email".to_string(),
                    value: "@EXAMPLE.com".to_string(),
                },
                Predicate::Always,
            ],
        };

        assert_eq!(condition.first_match(&vars(&[("plan", "pro")])), Some(0));
        assert_eq!(
            condition.first_match(&vars(&[("email", "a@example.com")])),
            Some(1)
        );
        assert_eq!(condition.first_match(&vars(&[])), Some(2));
    }

    #[test]
    fn condition_without_fallback_can_miss() {
        let condition = ConditionNode {
            branches: vec![Predicate::Exists {
                variable: "email".to_string(),
            }],
        };
        assert_eq!(condition.first_match(&vars(&[])), None);
        assert!(
            Predicate::Missing {
                variable: "email".to_string()
            }
            .evaluate(&vars(&[]))
        );
    }

    #[test]
    fn trigger_branch_first_declared_wins() {
        let trigger = TriggerNode {
            keyword_branches: vec![
                KeywordBranch {
                    keywords: vec!["price".to_string()],
                },
                KeywordBranch {
                    keywords: vec!["bootcamp".to_string()],
                },
            ],
        };
        assert_eq!(
            trigger.matching_branch(Some("Bootcamp price please")),
            Some(0)
        );
        assert_eq!(trigger.matching_branch(Some("love this BOOTCAMP")), Some(1));
        assert_eq!(trigger.matching_branch(Some("hello")), None);
        assert_eq!(trigger.matching_branch(None), None);
    }

    #[test]
    fn render_template_fills_known_variables() {
        let rendered = render_template("Hi {{ name }}, link: {{url}}{{missing}}", &vars(&[
            ("name", "Ada"),
            ("url", "example.com"),
        ]));
        assert_eq!(rendered, "Hi Ada, link: example.com");
        assert_eq!(render_template("broken {{tag", &vars(&[])), "broken {{tag");
    }
}
