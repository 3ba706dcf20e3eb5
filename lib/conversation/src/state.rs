//! Conversation state.
//!
//! A conversation is one execution of a flow for one external end user. Its
//! state is the durable cursor of the engine's state machine: everything the
//! engine needs to continue after a restart lives here, nothing is held in
//! memory across a WAITING suspension.
//!
//! The step log is append-only. It is the source of truth for two guards:
//! - a dispatch is skipped when an entry already carries its `DispatchKey`
//! - a funnel metric is counted when no entry already carries it

use chrono::{DateTime, Utc};
use replyflow_core::{FlowId, TimerId};
use replyflow_flow::{FunnelMetric, InboundEvent, NodeId, TriggerType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a conversation: one flow, one end user.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    /// The flow being executed.
    pub flow_id: FlowId,
    /// Platform ID of the end user.
    pub external_user_id: String,
}

impl ConversationKey {
    /// Creates a conversation key.
    #[must_use]
    pub fn new(flow_id: FlowId, external_user_id: impl Into<String>) -> Self {
        Self {
            flow_id,
            external_user_id: external_user_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_id, self.external_user_id)
    }
}

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationStatus {
    /// Actively advancing through the graph.
    Running,
    /// Suspended on a button tap, a reply, or a timer.
    Waiting,
    /// The graph ran out of edges.
    Completed,
    /// A fatal error ended the conversation.
    Aborted,
    /// The user went quiet past the inactivity window.
    Abandoned,
}

impl ConversationStatus {
    /// Returns true for RUNNING and WAITING.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Waiting)
    }

    /// Returns true if no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Returns the wire name of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Waiting => "WAITING",
            Self::Completed => "COMPLETED",
            Self::Aborted => "ABORTED",
            Self::Abandoned => "ABANDONED",
        }
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a WAITING conversation is blocked on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitingOn {
    /// A tap on one of the message's buttons.
    Button { node_id: NodeId },
    /// A free-text reply to be stored in `variable`.
    Reply { node_id: NodeId, variable: String },
    /// A durable timer.
    Timer {
        node_id: NodeId,
        timer_id: TimerId,
        fire_at: DateTime<Utc>,
    },
}

impl WaitingOn {
    /// The node that suspended the conversation.
    #[must_use]
    pub fn node_id(&self) -> &NodeId {
        match self {
            Self::Button { node_id } | Self::Reply { node_id, .. } | Self::Timer { node_id, .. } => {
                node_id
            }
        }
    }

    /// The pending timer, if waiting on one.
    #[must_use]
    pub fn timer_id(&self) -> Option<TimerId> {
        match self {
            Self::Timer { timer_id, .. } => Some(*timer_id),
            Self::Button { .. } | Self::Reply { .. } => None,
        }
    }
}

/// The event that created a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerContext {
    /// Event type that matched.
    pub event_type: TriggerType,
    /// Channel the event arrived on; outbound calls go back through it.
    pub channel_id: String,
    /// Comment or message text.
    #[serde(default)]
    pub text: Option<String>,
    /// Post the event referred to.
    #[serde(default)]
    pub media_id: Option<String>,
    /// Comment to reply to, for comment triggers.
    #[serde(default)]
    pub comment_id: Option<String>,
    /// Delivery that created the conversation.
    pub delivery_id: String,
}

impl TriggerContext {
    /// Captures the trigger context of an inbound event.
    #[must_use]
    pub fn from_event(event: &InboundEvent) -> Self {
        Self {
            event_type: event.event_type,
            channel_id: event.channel_id.clone(),
            text: event.text.clone(),
            media_id: event.media_id.clone(),
            comment_id: event.comment_id.clone(),
            delivery_id: event.delivery_id.clone(),
        }
    }
}

/// Identity of one dispatch attempt.
///
/// Built from the step-log length before the entry for the dispatch is
/// appended, so a replay of the same step produces the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchKey {
    pub flow_id: FlowId,
    pub external_user_id: String,
    pub node_id: NodeId,
    pub step: usize,
}

impl fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.flow_id, self.external_user_id, self.node_id, self.step
        )
    }
}

/// Outcome recorded for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepOutcome {
    /// The trigger node ran; `branch` is the keyword partition taken.
    Triggered { branch: Option<usize> },
    /// A direct message was delivered.
    Sent { message_id: String },
    /// A public comment reply was posted.
    Replied { reply_id: String },
    /// A variable was set locally.
    VariableSet { name: String },
    /// A condition selected a branch.
    ConditionMatched { branch: usize },
    /// A delay timer was scheduled.
    DelayScheduled {
        timer_id: TimerId,
        fire_at: DateTime<Utc>,
    },
    /// A delay timer fired.
    TimerFired { timer_id: TimerId },
    /// The user tapped a button.
    ButtonTapped { handle: usize },
    /// The user's reply was captured.
    InputCaptured { variable: String },
    /// The graph ran out of edges.
    Completed,
    /// The conversation was aborted.
    Aborted { reason: String },
    /// The inactivity window elapsed.
    Abandoned,
}

/// One entry of the step log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    /// Position in the log.
    pub seq: usize,
    /// Node the step ran on.
    pub node_id: NodeId,
    /// When the step was recorded.
    pub at: DateTime<Utc>,
    /// What happened.
    pub outcome: StepOutcome,
    /// Key of the dispatch this step performed, if any.
    #[serde(default)]
    pub dedup_key: Option<DispatchKey>,
    /// Funnel metrics counted by this step.
    #[serde(default)]
    pub metrics: Vec<FunnelMetric>,
}

/// Durable state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    /// Conversation identity.
    pub key: ConversationKey,
    /// Node the engine runs next, or is suspended on.
    pub cursor: NodeId,
    /// Lifecycle status.
    pub status: ConversationStatus,
    /// Suspension reason while WAITING.
    #[serde(default)]
    pub waiting_on: Option<WaitingOn>,
    /// Variables collected so far.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// The event that created the conversation.
    pub trigger: TriggerContext,
    /// Append-only step log.
    #[serde(default)]
    pub step_log: Vec<StepEntry>,
    /// Loop guard counter; bumped on every step and resume.
    #[serde(default)]
    pub steps: u32,
    /// Error that ended the conversation, if any.
    #[serde(default)]
    pub error: Option<String>,
    /// When the conversation started.
    pub created_at: DateTime<Utc>,
    /// Last step, resume, or status change.
    pub last_activity_at: DateTime<Utc>,
    /// Store revision this state was read at; 0 means never persisted.
    #[serde(default)]
    pub version: u64,
}

impl ConversationState {
    /// Creates a RUNNING conversation positioned on the trigger node.
    #[must_use]
    pub fn new(
        key: ConversationKey,
        trigger_node: NodeId,
        trigger: TriggerContext,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            cursor: trigger_node,
            status: ConversationStatus::Running,
            waiting_on: None,
            variables: BTreeMap::new(),
            trigger,
            step_log: Vec::new(),
            steps: 0,
            error: None,
            created_at: now,
            last_activity_at: now,
            version: 0,
        }
    }

    /// Returns true while RUNNING or WAITING.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// The dispatch key for running the current cursor node now.
    #[must_use]
    pub fn dispatch_key(&self) -> DispatchKey {
        DispatchKey {
            flow_id: self.key.flow_id,
            external_user_id: self.key.external_user_id.clone(),
            node_id: self.cursor.clone(),
            step: self.step_log.len(),
        }
    }

    /// Appends a step log entry and refreshes the activity timestamp.
    pub fn record(
        &mut self,
        node_id: NodeId,
        outcome: StepOutcome,
        dedup_key: Option<DispatchKey>,
        now: DateTime<Utc>,
    ) {
        let seq = self.step_log.len();
        self.step_log.push(StepEntry {
            seq,
            node_id,
            at: now,
            outcome,
            dedup_key,
            metrics: Vec::new(),
        });
        self.last_activity_at = now;
    }

    /// Returns true if any log entry already counted `metric`.
    #[must_use]
    pub fn has_metric(&self, metric: FunnelMetric) -> bool {
        self.step_log
            .iter()
            .any(|entry| entry.metrics.contains(&metric))
    }

    /// Tags the latest log entry with `metric` unless it was already counted.
    ///
    /// Returns true if the caller should increment the counter. An empty log
    /// has nothing to tag and never claims.
    pub fn claim_metric(&mut self, metric: FunnelMetric) -> bool {
        if self.has_metric(metric) {
            return false;
        }
        match self.step_log.last_mut() {
            Some(entry) => {
                entry.metrics.push(metric);
                true
            }
            None => false,
        }
    }

    /// Suspends the conversation.
    pub fn wait(&mut self, on: WaitingOn, now: DateTime<Utc>) {
        self.cursor = on.node_id().clone();
        self.status = ConversationStatus::Waiting;
        self.waiting_on = Some(on);
        self.last_activity_at = now;
    }

    /// Leaves WAITING and continues from the suspended node.
    pub fn wake(&mut self, now: DateTime<Utc>) {
        self.status = ConversationStatus::Running;
        self.waiting_on = None;
        self.last_activity_at = now;
    }

    /// Moves the cursor to the next node.
    pub fn advance(&mut self, next: NodeId) {
        self.cursor = next;
    }

    /// Increments the loop guard and returns the new count.
    pub fn bump_steps(&mut self) -> u32 {
        self.steps = self.steps.saturating_add(1);
        self.steps
    }

    /// Ends the conversation as COMPLETED.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.finish(ConversationStatus::Completed, StepOutcome::Completed, now);
    }

    /// Ends the conversation as ABORTED, recording the reason.
    pub fn abort(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        let reason = reason.into();
        self.error = Some(reason.clone());
        self.finish(ConversationStatus::Aborted, StepOutcome::Aborted { reason }, now);
    }

    /// Ends the conversation as ABANDONED.
    pub fn abandon(&mut self, now: DateTime<Utc>) {
        self.error = Some("inactivity timeout elapsed".to_string());
        self.finish(ConversationStatus::Abandoned, StepOutcome::Abandoned, now);
    }

    fn finish(&mut self, status: ConversationStatus, outcome: StepOutcome, now: DateTime<Utc>) {
        self.record(self.cursor.clone(), outcome, None, now);
        self.status = status;
        self.waiting_on = None;
    }
}
