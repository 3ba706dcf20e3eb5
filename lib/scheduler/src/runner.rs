//! Timer firing and conversation sweeps.
//!
//! `SchedulerRunner` does two periodic passes:
//! - `fire_due` resumes conversations whose DELAY timer is due
//! - `sweep` abandons conversations idle past the inactivity window and
//!   re-drives RUNNING conversations that stalled, e.g. after a crash
//!
//! Both passes are safe to run on several processes at once: the engine
//! serializes per conversation and ignores stale timers.

use crate::error::{SchedulerError, TimerError};
use crate::timer::{Timer, TimerStore};
use chrono::{DateTime, TimeDelta, Utc};
use replyflow_conversation::{ConversationFilter, ConversationStatus};
use replyflow_engine::{ExecutionEngine, ResumeInput, ResumeOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Runner tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerConfig {
    /// How often due timers are polled.
    pub poll_interval: Duration,
    /// How often conversations are swept.
    pub sweep_interval: Duration,
    /// WAITING conversations idle this long are abandoned.
    pub inactivity_timeout: TimeDelta,
    /// RUNNING conversations idle this long are re-driven.
    pub stall_timeout: TimeDelta,
    /// Maximum timers fired per poll.
    pub batch_size: usize,
    /// Delivery attempts before a timer is given up on.
    pub max_attempts: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(60),
            inactivity_timeout: TimeDelta::hours(24),
            stall_timeout: TimeDelta::minutes(5),
            batch_size: 100,
            max_attempts: 5,
        }
    }
}

/// What a sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Conversations moved to ABANDONED.
    pub abandoned: usize,
    /// Stalled RUNNING conversations re-driven.
    pub recovered: usize,
}

/// Fires timers and sweeps conversations.
pub struct SchedulerRunner {
    engine: Arc<ExecutionEngine>,
    timers: Arc<dyn TimerStore>,
    config: RunnerConfig,
}

impl SchedulerRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new(
        engine: Arc<ExecutionEngine>,
        timers: Arc<dyn TimerStore>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            engine,
            timers,
            config,
        }
    }

    /// Resumes conversations for every timer due at `now`.
    ///
    /// A timer is removed only after the engine returns, so a crash mid-pass
    /// fires it again. Returns the number of timers fired.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer store fails. Engine failures for a
    /// single timer are logged and the timer stays pending.
    #[instrument(skip(self))]
    pub async fn fire_due(&self, now: DateTime<Utc>) -> Result<usize, SchedulerError> {
        let due = self.timers.due(now, self.config.batch_size).await?;
        let mut fired = 0;
        for timer in due {
            if self.fire(&timer).await? {
                fired += 1;
            }
        }
        if fired > 0 {
            debug!(fired, "timers fired");
        }
        Ok(fired)
    }

    async fn fire(&self, timer: &Timer) -> Result<bool, SchedulerError> {
        match self.timers.record_attempt(timer.id).await {
            Ok(()) => {}
            Err(TimerError::NotFound { .. }) => {
                debug!(timer_id = %timer.id, "timer settled by another runner");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        let result = self
            .engine
            .resume(
                timer.key.flow_id,
                &timer.key.external_user_id,
                ResumeInput::TimerFired { timer_id: timer.id },
            )
            .await;

        match result {
            Ok(outcome) => {
                if let ResumeOutcome::Ignored(reason) = outcome {
                    debug!(timer_id = %timer.id, ?reason, "timer ignored by engine");
                }
                self.timers.mark_fired(timer.id).await?;
                Ok(true)
            }
            Err(e) if timer.attempts.saturating_add(1) >= self.config.max_attempts => {
                error!(
                    timer_id = %timer.id,
                    conversation = %timer.key,
                    error = %e,
                    "timer delivery failed too often, giving up"
                );
                self.timers.mark_fired(timer.id).await?;
                Ok(false)
            }
            Err(e) => {
                warn!(
                    timer_id = %timer.id,
                    conversation = %timer.key,
                    error = %e,
                    "timer delivery failed, will retry"
                );
                Ok(false)
            }
        }
    }

    /// Abandons idle WAITING conversations and re-drives stalled RUNNING ones.
    ///
    /// A conversation waiting on a DELAY only counts as idle once its timer
    /// is due; the engine makes that call.
    ///
    /// # Errors
    ///
    /// Returns an error if listing conversations fails. Failures on a single
    /// conversation are logged and skipped.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, SchedulerError> {
        let mut report = SweepReport::default();
        let conversations = self.engine.conversations();

        let idle = conversations
            .list(
                &ConversationFilter::all()
                    .statuses([ConversationStatus::Waiting])
                    .idle_before(now - self.config.inactivity_timeout),
            )
            .await
            .map_err(|e| SchedulerError::Engine(e.into()))?;
        for state in idle {
            match self
                .engine
                .abandon_if_idle(&state.key, now, self.config.inactivity_timeout)
                .await
            {
                Ok(true) => report.abandoned += 1,
                Ok(false) => {}
                Err(e) => warn!(conversation = %state.key, error = %e, "abandon failed"),
            }
        }

        let stalled = conversations
            .list(
                &ConversationFilter::all()
                    .statuses([ConversationStatus::Running])
                    .idle_before(now - self.config.stall_timeout),
            )
            .await
            .map_err(|e| SchedulerError::Engine(e.into()))?;
        for state in stalled {
            match self
                .engine
                .recover(state.key.flow_id, &state.key.external_user_id)
                .await
            {
                Ok(Some(_)) => report.recovered += 1,
                Ok(None) => {}
                Err(e) => warn!(conversation = %state.key, error = %e, "recovery failed"),
            }
        }

        if report != SweepReport::default() {
            info!(
                abandoned = report.abandoned,
                recovered = report.recovered,
                "sweep finished"
            );
        }
        Ok(report)
    }

    /// Polls and sweeps until `shutdown` becomes true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_interval = ?self.config.poll_interval,
            sweep_interval = ?self.config.sweep_interval,
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.fire_due(Utc::now()).await {
                        error!(error = %e, "timer pass failed");
                    }
                }
                _ = sweep.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        error!(error = %e, "sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::DurableScheduler;
    use crate::timer::InMemoryTimerStore;
    use replyflow_conversation::{
        ConversationKey, ConversationState, ConversationStateStore, InMemoryConversationStore,
        StepOutcome, TriggerContext,
    };
    use replyflow_core::WorkspaceId;
    use replyflow_engine::{
        DryRunGateway, EngineConfig, FlowStore, InMemoryFlowStore, InMemoryStatsStore,
        StartOutcome,
    };
    use replyflow_flow::{
        Button, Edge, Flow, FunnelMetric, MessageNode, Node, NodeId, PublishedFlow, TriggerRule,
        TriggerType,
    };

    struct Fixture {
        flows: Arc<InMemoryFlowStore>,
        conversations: Arc<InMemoryConversationStore>,
        gateway: Arc<DryRunGateway>,
        timers: Arc<InMemoryTimerStore>,
        engine: Arc<ExecutionEngine>,
        runner: SchedulerRunner,
    }

    impl Fixture {
        fn new() -> Self {
            let flows = Arc::new(InMemoryFlowStore::new());
            let conversations = Arc::new(InMemoryConversationStore::new());
            let gateway = Arc::new(DryRunGateway::new());
            let timers = Arc::new(InMemoryTimerStore::new());
            let engine = Arc::new(ExecutionEngine::new(
                flows.clone(),
                conversations.clone(),
                gateway.clone(),
                Arc::new(InMemoryStatsStore::new()),
                Arc::new(DurableScheduler::new(timers.clone())),
                EngineConfig::default(),
            ));
            let runner = SchedulerRunner::new(
                engine.clone(),
                timers.clone(),
                RunnerConfig {
                    poll_interval: Duration::from_millis(5),
                    sweep_interval: Duration::from_millis(5),
                    ..RunnerConfig::default()
                },
            );
            Self {
                flows,
                conversations,
                gateway,
                timers,
                engine,
                runner,
            }
        }

        async fn publish(&self, flow: Flow) -> Arc<PublishedFlow> {
            let published = flow.publish().expect("valid flow");
            let id = published.id();
            self.flows.publish(published).await.expect("publish");
            self.flows.get(id).await.expect("get").expect("exists")
        }

        async fn start(&self, flow: &PublishedFlow, user: &str) -> ConversationState {
            let outcome = self
                .engine
                .start(flow, user, context(user))
                .await
                .expect("start");
            match outcome {
                StartOutcome::Started(state) => state,
                other => panic!("expected Started, got {other:?}"),
            }
        }

        async fn stat(&self, flow: &PublishedFlow, metric: FunnelMetric) -> u64 {
            self.engine.stats().get_stats(flow.id()).await.expect("stats")[&metric]
        }
    }

    fn context(user: &str) -> TriggerContext {
        TriggerContext {
            event_type: TriggerType::Comment,
            channel_id: "chan".to_string(),
            text: Some("bootcamp".to_string()),
            media_id: None,
            comment_id: Some(format!("c-{user}")),
            delivery_id: format!("d-{user}"),
        }
    }

    fn flow() -> Flow {
        Flow::new(
            WorkspaceId::new(),
            "chan",
            "bootcamp",
            TriggerRule::any(TriggerType::Comment),
        )
        .with_node(Node::trigger("t"))
    }

    fn button_flow() -> Flow {
        flow()
            .with_node(Node::message(
                "ask",
                MessageNode::text("Want the link?")
                    .with_button(Button::new("Get link").with_metric(FunnelMetric::LinkClicked))
                    .with_metric(FunnelMetric::OpeningMsgSent),
            ))
            .with_node(Node::message(
                "link",
                MessageNode::text("Here: example.com/link")
                    .with_metric(FunnelMetric::LinkMsgSent),
            ))
            .with_edge(Edge::new("e1", "t", "ask"))
            .with_edge(Edge::branch("e2", "ask", 0, "link"))
    }

    fn delay_flow(seconds: u64) -> Flow {
        flow()
            .with_node(Node::delay("wait", seconds))
            .with_node(Node::message("later", MessageNode::text("still there?")))
            .with_edge(Edge::new("e1", "t", "wait"))
            .with_edge(Edge::new("e2", "wait", "later"))
    }

    #[tokio::test]
    async fn sweep_abandons_idle_waiting_conversation() {
        let fixture = Fixture::new();
        let flow = fixture.publish(button_flow()).await;
        let state = fixture.start(&flow, "user-1").await;
        assert_eq!(state.status, ConversationStatus::Waiting);

        let report = fixture.runner.sweep(Utc::now()).await.expect("sweep");
        assert_eq!(report.abandoned, 0);

        let later = Utc::now() + TimeDelta::hours(25);
        let report = fixture.runner.sweep(later).await.expect("sweep");
        assert_eq!(report.abandoned, 1);

        let stored = fixture
            .conversations
            .get(&state.key)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, ConversationStatus::Abandoned);

        fixture
            .engine
            .resume(flow.id(), "user-1", ResumeInput::ButtonTap { handle: 0 })
            .await
            .expect("resume");
        assert_eq!(fixture.stat(&flow, FunnelMetric::LinkClicked).await, 0);
        assert_eq!(fixture.stat(&flow, FunnelMetric::LinkMsgSent).await, 0);
        assert_eq!(fixture.gateway.direct_messages().len(), 1);
    }

    #[tokio::test]
    async fn due_timer_resumes_conversation() {
        let fixture = Fixture::new();
        let flow = fixture.publish(delay_flow(0)).await;
        let state = fixture.start(&flow, "user-1").await;
        assert_eq!(state.status, ConversationStatus::Waiting);
        let timer_id = state
            .waiting_on
            .as_ref()
            .and_then(|w| w.timer_id())
            .expect("timer");

        let fired = fixture
            .runner
            .fire_due(Utc::now() + TimeDelta::seconds(1))
            .await
            .expect("fire");
        assert_eq!(fired, 1);

        let stored = fixture
            .conversations
            .get(&state.key)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, ConversationStatus::Completed);
        assert_eq!(fixture.gateway.direct_messages().len(), 1);

        assert!(matches!(
            fixture.timers.get(timer_id).await,
            Err(TimerError::NotFound { .. })
        ));

        // Redelivery after a crash is ignored by the engine.
        let outcome = fixture
            .engine
            .resume(flow.id(), "user-1", ResumeInput::TimerFired { timer_id })
            .await
            .expect("resume");
        assert!(matches!(outcome, ResumeOutcome::Ignored(_)));
        assert_eq!(fixture.gateway.direct_messages().len(), 1);
    }

    #[tokio::test]
    async fn future_timer_is_not_fired() {
        let fixture = Fixture::new();
        let flow = fixture.publish(delay_flow(3600)).await;
        fixture.start(&flow, "user-1").await;

        let fired = fixture.runner.fire_due(Utc::now()).await.expect("fire");
        assert_eq!(fired, 0);
    }

    #[tokio::test]
    async fn abandoning_delay_cancels_timer() {
        let fixture = Fixture::new();
        let flow = fixture.publish(delay_flow(3600)).await;
        let state = fixture.start(&flow, "user-1").await;
        let timer_id = state
            .waiting_on
            .as_ref()
            .and_then(|w| w.timer_id())
            .expect("timer");

        let report = fixture
            .runner
            .sweep(Utc::now() + TimeDelta::hours(26))
            .await
            .expect("sweep");
        assert_eq!(report.abandoned, 1);
        assert!(fixture.timers.due(DateTime::<Utc>::MAX_UTC, 10).await.expect("due").is_empty());
        assert!(fixture.timers.get(timer_id).await.is_err());
    }

    #[tokio::test]
    async fn delay_longer_than_inactivity_window_still_fires() {
        let fixture = Fixture::new();
        let flow = fixture.publish(delay_flow(48 * 3600)).await;
        let state = fixture.start(&flow, "user-1").await;
        assert_eq!(state.status, ConversationStatus::Waiting);
        let started = Utc::now();

        let report = fixture
            .runner
            .sweep(started + TimeDelta::hours(25))
            .await
            .expect("sweep");
        assert_eq!(report.abandoned, 0);

        let fired = fixture
            .runner
            .fire_due(started + TimeDelta::hours(49))
            .await
            .expect("fire");
        assert_eq!(fired, 1);

        let stored = fixture
            .conversations
            .get(&state.key)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, ConversationStatus::Completed);
        assert_eq!(fixture.gateway.direct_messages().len(), 1);
    }

    #[tokio::test]
    async fn overdue_delay_is_abandoned_after_window() {
        let fixture = Fixture::new();
        let flow = fixture.publish(delay_flow(3600)).await;
        fixture.start(&flow, "user-1").await;
        let started = Utc::now();

        // The timer came due at +1h but was never delivered.
        let report = fixture
            .runner
            .sweep(started + TimeDelta::hours(24))
            .await
            .expect("sweep");
        assert_eq!(report.abandoned, 0);

        let report = fixture
            .runner
            .sweep(started + TimeDelta::hours(26))
            .await
            .expect("sweep");
        assert_eq!(report.abandoned, 1);
    }

    #[tokio::test]
    async fn sweep_recovers_stalled_running_conversation() {
        let fixture = Fixture::new();
        let flow = fixture.publish(button_flow()).await;

        let mut state = ConversationState::new(
            ConversationKey::new(flow.id(), "user-1"),
            NodeId::new("t"),
            context("user-1"),
            Utc::now(),
        );
        state.record(
            NodeId::new("t"),
            StepOutcome::Triggered { branch: None },
            None,
            Utc::now(),
        );
        state.advance(NodeId::new("ask"));
        fixture.conversations.put(&state).await.expect("put");

        let report = fixture
            .runner
            .sweep(Utc::now() + TimeDelta::minutes(10))
            .await
            .expect("sweep");
        assert_eq!(report.recovered, 1);
        assert_eq!(fixture.gateway.direct_messages().len(), 1);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fixture = Fixture::new();
        let flow = fixture.publish(delay_flow(0)).await;
        let state = fixture.start(&flow, "user-1").await;
        let (tx, rx) = watch::channel(false);

        let run = fixture.runner.run(rx);
        let stop = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).expect("send");
        };
        tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(run, stop) })
            .await
            .expect("runner stopped");

        let stored = fixture
            .conversations
            .get(&state.key)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.status, ConversationStatus::Completed);
    }
}
