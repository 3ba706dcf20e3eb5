//! The conversation state machine.
//!
//! `ExecutionEngine` walks a published flow graph for one conversation at a
//! time. Each node is one step:
//!
//! 1. Bump the loop guard
//! 2. Run the node (a single `match` over `NodeKind`)
//! 3. Persist the state with compare-and-swap on its version
//! 4. Record the funnel metrics claimed by the step
//!
//! A conversation stops being driven when it suspends (WAITING) or ends.
//! Nothing is held in memory across a suspension: `resume` reloads the
//! state, checks the input against `waiting_on`, and drives again.

use crate::dispatcher::{ActionDispatcher, Effect, RetryPolicy};
use crate::error::{EngineError, GraphError};
use crate::gateway::MessagingGateway;
use crate::lease::ConversationLocks;
use crate::stats::{StatsRecorder, StatsStore};
use crate::store::FlowStore;
use crate::timer::TimerScheduler;
use chrono::{DateTime, TimeDelta, Utc};
use replyflow_conversation::{
    ConversationFilter, ConversationKey, ConversationState, ConversationStateStore,
    ConversationStatus, StepOutcome, TriggerContext, WaitingOn,
};
use replyflow_core::{FlowId, TimerId};
use replyflow_flow::{
    FlowGraph, FunnelMetric, Node, NodeId, NodeKind, PublishedFlow, TriggerType,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Default ceiling on steps per conversation.
pub const DEFAULT_MAX_STEPS: u32 = 50;

/// Engine tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Steps (including resumes) after which a conversation is aborted.
    pub max_steps: u32,
    /// Gateway retry policy.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            retry: RetryPolicy::default(),
        }
    }
}

/// Result of `ExecutionEngine::start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "conversation", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A new conversation ran until it suspended or ended.
    Started(ConversationState),
    /// The user already has a RUNNING or WAITING conversation on this flow.
    AlreadyActive,
    /// The user already finished this flow; it is not restarted.
    AlreadyHandled,
}

/// Input that wakes a WAITING conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumeInput {
    /// The user tapped the button with this index.
    ButtonTap { handle: usize },
    /// The user sent a free-text reply.
    Reply { text: String },
    /// A DELAY timer fired.
    TimerFired { timer_id: TimerId },
}

impl ResumeInput {
    fn kind(&self) -> &'static str {
        match self {
            Self::ButtonTap { .. } => "button_tap",
            Self::Reply { .. } => "reply",
            Self::TimerFired { .. } => "timer_fired",
        }
    }
}

/// Why a resume was ignored. Ignored inputs never mutate the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum IgnoreReason {
    /// No conversation exists for the key.
    NotFound,
    /// The conversation is not WAITING.
    NotWaiting { status: ConversationStatus },
    /// The input does not fit what the conversation waits on.
    InputMismatch,
    /// The timer is not the one the conversation waits on.
    StaleTimer,
    /// The message has no button with this index.
    UnknownButton { handle: usize },
}

/// Result of `ExecutionEngine::resume`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum ResumeOutcome {
    /// The input was accepted and the conversation driven onward.
    Resumed(ConversationState),
    /// The input was dropped.
    Ignored(IgnoreReason),
}

/// Executes flows for conversations.
pub struct ExecutionEngine {
    flows: Arc<dyn FlowStore>,
    conversations: Arc<dyn ConversationStateStore>,
    dispatcher: ActionDispatcher,
    stats: StatsRecorder,
    timers: Arc<dyn TimerScheduler>,
    locks: ConversationLocks,
    config: EngineConfig,
}

impl ExecutionEngine {
    /// Creates an engine over the given ports.
    #[must_use]
    pub fn new(
        flows: Arc<dyn FlowStore>,
        conversations: Arc<dyn ConversationStateStore>,
        gateway: Arc<dyn MessagingGateway>,
        stats: Arc<dyn StatsStore>,
        timers: Arc<dyn TimerScheduler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            flows,
            conversations,
            dispatcher: ActionDispatcher::new(gateway, config.retry),
            stats: StatsRecorder::new(stats),
            timers,
            locks: ConversationLocks::new(),
            config,
        }
    }

    /// The flow store the engine reads from.
    #[must_use]
    pub fn flows(&self) -> &Arc<dyn FlowStore> {
        &self.flows
    }

    /// The conversation store the engine writes to.
    #[must_use]
    pub fn conversations(&self) -> &Arc<dyn ConversationStateStore> {
        &self.conversations
    }

    /// The funnel metric recorder.
    #[must_use]
    pub fn stats(&self) -> &StatsRecorder {
        &self.stats
    }

    /// Starts a conversation of `flow` for the user.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the scheduler fails. Gateway and graph
    /// failures end the conversation instead.
    #[instrument(skip(self, flow, trigger), fields(flow_id = %flow.id(), delivery_id = %trigger.delivery_id))]
    pub async fn start(
        &self,
        flow: &PublishedFlow,
        external_user_id: &str,
        trigger: TriggerContext,
    ) -> Result<StartOutcome, EngineError> {
        let key = ConversationKey::new(flow.id(), external_user_id);
        let _lease = self.locks.acquire(&key).await;

        if let Some(existing) = self.conversations.get(&key).await? {
            debug!(status = %existing.status, "conversation already exists");
            return Ok(if existing.is_active() {
                StartOutcome::AlreadyActive
            } else {
                StartOutcome::AlreadyHandled
            });
        }

        let state = ConversationState::new(
            key,
            flow.graph().trigger().id.clone(),
            trigger,
            Utc::now(),
        );
        info!(external_user_id, "starting conversation");
        match self.drive(flow, state).await {
            Ok(state) => Ok(StartOutcome::Started(state)),
            Err(e) if e.is_conflict() => {
                info!("another writer created the conversation first");
                Ok(StartOutcome::AlreadyActive)
            }
            Err(e) => Err(e),
        }
    }

    /// Feeds an input to a WAITING conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the scheduler fails, or if the flow
    /// has been deleted.
    #[instrument(skip(self, input), fields(flow_id = %flow_id, input = input.kind()))]
    pub async fn resume(
        &self,
        flow_id: FlowId,
        external_user_id: &str,
        input: ResumeInput,
    ) -> Result<ResumeOutcome, EngineError> {
        let key = ConversationKey::new(flow_id, external_user_id);
        let _lease = self.locks.acquire(&key).await;

        let Some(mut state) = self.conversations.get(&key).await? else {
            return Ok(ResumeOutcome::Ignored(IgnoreReason::NotFound));
        };
        let Some(waiting_on) = state.waiting_on.clone().filter(|_| {
            state.status == ConversationStatus::Waiting
        }) else {
            debug!(status = %state.status, "resume ignored, not waiting");
            return Ok(ResumeOutcome::Ignored(IgnoreReason::NotWaiting {
                status: state.status,
            }));
        };

        let flow = self.load_flow(flow_id).await?;
        let graph = flow.graph();
        let node_id = waiting_on.node_id().clone();
        let now = Utc::now();
        let mut claimed = Vec::new();

        let Some(node) = graph.node(&node_id) else {
            self.fail(&mut state, GraphError::NodeNotFound { node_id }, now);
            self.persist(&mut state, &mut claimed).await?;
            return Ok(ResumeOutcome::Resumed(state));
        };

        let accepted = match accept(node, &waiting_on, input) {
            Ok(accepted) => accepted,
            Err(reason) => {
                debug!(?reason, "resume ignored");
                return Ok(ResumeOutcome::Ignored(reason));
            }
        };

        state.wake(now);
        if let Some((variable, value)) = accepted.capture {
            state.variables.insert(variable, value);
        }
        if self.guard_steps(&mut state, now) {
            state.record(node_id.clone(), accepted.outcome, None, now);
            if let Some(metric) = accepted.metric {
                self.claim(&mut state, metric, &mut claimed);
            }
            follow(graph, &mut state, &node_id, accepted.handle, now);
        }
        self.persist(&mut state, &mut claimed).await?;

        let state = self.drive(&flow, state).await?;
        Ok(ResumeOutcome::Resumed(state))
    }

    /// Re-drives a RUNNING conversation after a crash or stall.
    ///
    /// Returns `None` if the conversation is not RUNNING. Dispatches that
    /// already went out are deduplicated by their idempotency key.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the scheduler fails.
    #[instrument(skip(self), fields(flow_id = %flow_id))]
    pub async fn recover(
        &self,
        flow_id: FlowId,
        external_user_id: &str,
    ) -> Result<Option<ConversationState>, EngineError> {
        let key = ConversationKey::new(flow_id, external_user_id);
        let _lease = self.locks.acquire(&key).await;

        let Some(state) = self.conversations.get(&key).await? else {
            return Ok(None);
        };
        if state.status != ConversationStatus::Running {
            return Ok(None);
        }
        let flow = self.load_flow(flow_id).await?;
        info!(cursor = %state.cursor, "recovering conversation");
        self.drive(&flow, state).await.map(Some)
    }

    /// Marks a WAITING conversation ABANDONED if it has been idle for
    /// `window` as of `now`. Returns true if it was abandoned.
    ///
    /// A conversation parked on a DELAY is not idle until its timer is due,
    /// so delays longer than `window` still fire.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the scheduler fails.
    #[instrument(skip(self), fields(conversation = %key))]
    pub async fn abandon_if_idle(
        &self,
        key: &ConversationKey,
        now: DateTime<Utc>,
        window: TimeDelta,
    ) -> Result<bool, EngineError> {
        let _lease = self.locks.acquire(key).await;

        let Some(mut state) = self.conversations.get(key).await? else {
            return Ok(false);
        };
        let idle = state.status == ConversationStatus::Waiting
            && idle_since(&state)
                .checked_add_signed(window)
                .is_some_and(|deadline| deadline <= now);
        if !idle {
            return Ok(false);
        }

        self.cancel_timer(&state).await?;
        state.abandon(now);
        self.persist(&mut state, &mut Vec::new()).await?;
        info!("conversation abandoned after inactivity");
        Ok(true)
    }

    /// Hard-aborts an active conversation. Returns false if it was not active.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the scheduler fails.
    #[instrument(skip(self), fields(conversation = %key))]
    pub async fn abort(&self, key: &ConversationKey, reason: &str) -> Result<bool, EngineError> {
        let _lease = self.locks.acquire(key).await;

        let Some(mut state) = self.conversations.get(key).await? else {
            return Ok(false);
        };
        if !state.is_active() {
            return Ok(false);
        }

        self.cancel_timer(&state).await?;
        state.abort(reason, Utc::now());
        self.persist(&mut state, &mut Vec::new()).await?;
        info!(reason, "conversation aborted");
        Ok(true)
    }

    /// Deactivates a flow and aborts all of its active conversations.
    ///
    /// Returns the number of conversations aborted.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::FlowNotFound` for an unknown flow, or an error
    /// if a store fails.
    #[instrument(skip(self), fields(flow_id = %flow_id))]
    pub async fn abort_flow(&self, flow_id: FlowId) -> Result<usize, EngineError> {
        if !self.flows.set_active(flow_id, false).await? {
            return Err(EngineError::FlowNotFound { flow_id });
        }

        let active = self
            .conversations
            .list(
                &ConversationFilter::all()
                    .flow(flow_id)
                    .statuses([ConversationStatus::Running, ConversationStatus::Waiting]),
            )
            .await?;

        let mut aborted = 0;
        for state in active {
            if self.abort(&state.key, "flow aborted by operator").await? {
                aborted += 1;
            }
        }
        info!(aborted, "flow hard-aborted");
        Ok(aborted)
    }

    async fn load_flow(&self, flow_id: FlowId) -> Result<Arc<PublishedFlow>, EngineError> {
        self.flows
            .get(flow_id)
            .await?
            .ok_or(EngineError::FlowNotFound { flow_id })
    }

    /// Steps the conversation until it suspends or ends.
    async fn drive(
        &self,
        flow: &PublishedFlow,
        mut state: ConversationState,
    ) -> Result<ConversationState, EngineError> {
        while state.status == ConversationStatus::Running {
            let mut claimed = Vec::new();
            self.step(flow.graph(), &mut state, &mut claimed).await?;
            self.persist(&mut state, &mut claimed).await?;
        }
        debug!(status = %state.status, steps = state.steps, "conversation yielded");
        Ok(state)
    }

    /// Runs the node under the cursor.
    #[instrument(skip_all, fields(node_id = %state.cursor, step = state.steps))]
    async fn step(
        &self,
        graph: &FlowGraph,
        state: &mut ConversationState,
        claimed: &mut Vec<FunnelMetric>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        if !self.guard_steps(state, now) {
            return Ok(());
        }
        let Some(node) = graph.node(&state.cursor) else {
            let node_id = state.cursor.clone();
            self.fail(state, GraphError::NodeNotFound { node_id }, now);
            return Ok(());
        };
        let node_id = node.id.clone();

        match &node.kind {
            NodeKind::Trigger(trigger) => {
                let branch = trigger.matching_branch(state.trigger.text.as_deref());
                state.record(node_id.clone(), StepOutcome::Triggered { branch }, None, now);
                self.claim(state, FunnelMetric::TotalTriggered, claimed);
                if state.trigger.event_type == TriggerType::Follow {
                    self.claim(state, FunnelMetric::FollowConfirmed, claimed);
                }
                let handle = branch.filter(|b| graph.next(&node_id, Some(*b)).is_some());
                follow(graph, state, &node_id, handle, now);
            }
            NodeKind::Message(message) => {
                if !self.dispatch(node, state, now).await {
                    return Ok(());
                }
                if let Some(metric) = message.metric {
                    self.claim(state, metric, claimed);
                }
                if !message.buttons.is_empty() {
                    state.wait(WaitingOn::Button { node_id }, now);
                } else if let Some(capture) = &message.capture {
                    state.wait(
                        WaitingOn::Reply {
                            node_id,
                            variable: capture.variable.clone(),
                        },
                        now,
                    );
                } else {
                    follow(graph, state, &node_id, None, now);
                }
            }
            NodeKind::Action(action) => {
                if !self.dispatch(node, state, now).await {
                    return Ok(());
                }
                if let Some(metric) = action.metric {
                    self.claim(state, metric, claimed);
                }
                follow(graph, state, &node_id, None, now);
            }
            NodeKind::Condition(condition) => match condition.first_match(&state.variables) {
                Some(branch) => {
                    state.record(
                        node_id.clone(),
                        StepOutcome::ConditionMatched { branch },
                        None,
                        now,
                    );
                    follow(graph, state, &node_id, Some(branch), now);
                }
                None => self.fail(state, GraphError::NoMatchingBranch { node_id }, now),
            },
            NodeKind::Delay(delay) => {
                let fire_at = i64::try_from(delay.seconds)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .and_then(|delta| now.checked_add_signed(delta))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                let timer_id = self.timers.schedule(&state.key, fire_at).await?;
                state.record(
                    node_id.clone(),
                    StepOutcome::DelayScheduled { timer_id, fire_at },
                    None,
                    now,
                );
                state.wait(
                    WaitingOn::Timer {
                        node_id,
                        timer_id,
                        fire_at,
                    },
                    now,
                );
            }
        }
        Ok(())
    }

    /// Performs the node's outbound action and logs it.
    ///
    /// The step is persisted only after the gateway call, so a replay after a
    /// crash repeats the call. It derives the same dispatch key from the
    /// unchanged step log, and the gateway deduplicates on it.
    ///
    /// Returns false if the conversation was aborted.
    async fn dispatch(&self, node: &Node, state: &mut ConversationState, now: DateTime<Utc>) -> bool {
        let key = state.dispatch_key();

        let outcome = match self.dispatcher.dispatch(node, state, &key).await {
            Ok(Effect::Sent { message_id }) => StepOutcome::Sent { message_id },
            Ok(Effect::Replied { reply_id }) => StepOutcome::Replied { reply_id },
            Ok(Effect::VariableSet { name, value }) => {
                state.variables.insert(name.clone(), value);
                StepOutcome::VariableSet { name }
            }
            Ok(Effect::NoOp) => return true,
            Err(e) => {
                warn!(error = %e, dedup_key = %key, "dispatch failed, aborting conversation");
                state.abort(e.to_string(), now);
                return false;
            }
        };
        state.record(node.id.clone(), outcome, Some(key), now);
        true
    }

    /// Bumps the loop guard, aborting past the ceiling.
    ///
    /// Returns false if the conversation was aborted.
    fn guard_steps(&self, state: &mut ConversationState, now: DateTime<Utc>) -> bool {
        if state.bump_steps() > self.config.max_steps {
            let limit = self.config.max_steps;
            self.fail(state, GraphError::StepLimitExceeded { limit }, now);
            return false;
        }
        true
    }

    fn fail(&self, state: &mut ConversationState, error: GraphError, now: DateTime<Utc>) {
        warn!(error = %error, "graph error, aborting conversation");
        state.abort(error.to_string(), now);
    }

    fn claim(
        &self,
        state: &mut ConversationState,
        metric: FunnelMetric,
        claimed: &mut Vec<FunnelMetric>,
    ) {
        if self.stats.claim(state, metric) {
            claimed.push(metric);
        }
    }

    async fn cancel_timer(&self, state: &ConversationState) -> Result<(), EngineError> {
        if let Some(timer_id) = state.waiting_on.as_ref().and_then(WaitingOn::timer_id) {
            self.timers.cancel(timer_id).await?;
        }
        Ok(())
    }

    /// Writes the state and, once committed, records the claimed metrics.
    async fn persist(
        &self,
        state: &mut ConversationState,
        claimed: &mut Vec<FunnelMetric>,
    ) -> Result<(), EngineError> {
        state.version = self.conversations.put(state).await?;
        for metric in claimed.drain(..) {
            self.stats.record(state.key.flow_id, metric).await;
        }
        Ok(())
    }
}

/// An accepted resume input.
struct Accepted {
    outcome: StepOutcome,
    handle: Option<usize>,
    metric: Option<FunnelMetric>,
    capture: Option<(String, String)>,
}

/// Checks a resume input against what the conversation waits on.
fn accept(node: &Node, waiting_on: &WaitingOn, input: ResumeInput) -> Result<Accepted, IgnoreReason> {
    match (waiting_on, input) {
        (WaitingOn::Button { .. }, ResumeInput::ButtonTap { handle }) => {
            let NodeKind::Message(message) = &node.kind else {
                return Err(IgnoreReason::InputMismatch);
            };
            let button = message
                .buttons
                .get(handle)
                .ok_or(IgnoreReason::UnknownButton { handle })?;
            Ok(Accepted {
                outcome: StepOutcome::ButtonTapped { handle },
                handle: Some(handle),
                metric: button.metric,
                capture: None,
            })
        }
        (WaitingOn::Reply { variable, .. }, ResumeInput::Reply { text }) => {
            let metric = match &node.kind {
                NodeKind::Message(message) => message.capture.as_ref().and_then(|c| c.metric),
                _ => None,
            };
            Ok(Accepted {
                outcome: StepOutcome::InputCaptured {
                    variable: variable.clone(),
                },
                handle: None,
                metric,
                capture: Some((variable.clone(), text)),
            })
        }
        (WaitingOn::Timer { timer_id, .. }, ResumeInput::TimerFired { timer_id: fired }) => {
            if *timer_id != fired {
                return Err(IgnoreReason::StaleTimer);
            }
            Ok(Accepted {
                outcome: StepOutcome::TimerFired { timer_id: fired },
                handle: None,
                metric: None,
                capture: None,
            })
        }
        _ => Err(IgnoreReason::InputMismatch),
    }
}

/// When the conversation stopped making progress: its last activity, or the
/// timer's due time if that is later.
fn idle_since(state: &ConversationState) -> DateTime<Utc> {
    match &state.waiting_on {
        Some(WaitingOn::Timer { fire_at, .. }) => state.last_activity_at.max(*fire_at),
        _ => state.last_activity_at,
    }
}

/// Moves along the edge `(from, handle)`, completing if there is none.
fn follow(
    graph: &FlowGraph,
    state: &mut ConversationState,
    from: &NodeId,
    handle: Option<usize>,
    now: DateTime<Utc>,
) {
    match graph.next(from, handle) {
        Some(next) => state.advance(next.clone()),
        None => state.complete(now),
    }
}
