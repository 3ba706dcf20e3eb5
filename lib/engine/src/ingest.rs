//! Inbound event routing.
//!
//! `EventRouter` sits between the webhook normalizer and the engine:
//! - Redeliveries are dropped by delivery ID before anything else runs
//! - A DM reply wakes the user's conversation waiting on free text, if any
//! - Otherwise the event goes through trigger matching and starts a flow
//!
//! When the engine fails on infrastructure, the delivery ID is forgotten so
//! the platform's own redelivery gets another chance.

use crate::dedup::DeliveryDedup;
use crate::engine::{ExecutionEngine, IgnoreReason, ResumeInput, ResumeOutcome, StartOutcome};
use crate::error::EngineError;
use replyflow_conversation::{
    ConversationFilter, ConversationState, ConversationStatus, TriggerContext, WaitingOn,
};
use replyflow_core::FlowId;
use replyflow_flow::{InboundEvent, TriggerMatcher, TriggerType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// A button tap or other postback addressed to a known conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Postback {
    pub flow_id: FlowId,
    pub external_user_id: String,
    pub input: ResumeInput,
    pub delivery_id: String,
}

/// What happened to an inbound delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// The delivery ID was seen within the dedup window.
    Duplicate,
    /// No active flow accepted the event.
    NoMatch,
    /// The matched flow already has an active conversation with the user.
    AlreadyActive,
    /// The user already finished the matched flow.
    AlreadyHandled,
    /// A conversation was started.
    Started(ConversationState),
    /// A waiting conversation accepted the input.
    Resumed(ConversationState),
    /// The input did not fit the conversation.
    Ignored(IgnoreReason),
}

impl From<StartOutcome> for IngestOutcome {
    fn from(outcome: StartOutcome) -> Self {
        match outcome {
            StartOutcome::Started(state) => Self::Started(state),
            StartOutcome::AlreadyActive => Self::AlreadyActive,
            StartOutcome::AlreadyHandled => Self::AlreadyHandled,
        }
    }
}

impl From<ResumeOutcome> for IngestOutcome {
    fn from(outcome: ResumeOutcome) -> Self {
        match outcome {
            ResumeOutcome::Resumed(state) => Self::Resumed(state),
            ResumeOutcome::Ignored(reason) => Self::Ignored(reason),
        }
    }
}

/// Entry point for normalized platform events.
pub struct EventRouter {
    engine: Arc<ExecutionEngine>,
    dedup: DeliveryDedup,
}

impl EventRouter {
    /// Creates a router over the engine.
    #[must_use]
    pub fn new(engine: Arc<ExecutionEngine>, dedup: DeliveryDedup) -> Self {
        Self { engine, dedup }
    }

    /// The engine events are routed to.
    #[must_use]
    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    /// Handles a comment, DM, or follow event.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the scheduler fails; the delivery may
    /// then be retried.
    #[instrument(
        skip(self, event),
        fields(
            delivery_id = %event.delivery_id,
            channel_id = %event.channel_id,
            event_type = %event.event_type,
        )
    )]
    pub async fn handle_event(&self, event: &InboundEvent) -> Result<IngestOutcome, EngineError> {
        if !self.dedup.check_and_insert(&event.delivery_id) {
            debug!("duplicate delivery dropped");
            return Ok(IngestOutcome::Duplicate);
        }
        let result = self.route(event).await;
        if result.is_err() {
            self.dedup.forget(&event.delivery_id);
        }
        result
    }

    /// Handles a postback for a specific conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if a store or the scheduler fails; the delivery may
    /// then be retried.
    #[instrument(
        skip(self, postback),
        fields(delivery_id = %postback.delivery_id, flow_id = %postback.flow_id)
    )]
    pub async fn handle_postback(&self, postback: Postback) -> Result<IngestOutcome, EngineError> {
        if !self.dedup.check_and_insert(&postback.delivery_id) {
            debug!("duplicate postback dropped");
            return Ok(IngestOutcome::Duplicate);
        }
        let result = self
            .engine
            .resume(postback.flow_id, &postback.external_user_id, postback.input)
            .await;
        match result {
            Ok(outcome) => Ok(outcome.into()),
            Err(e) => {
                self.dedup.forget(&postback.delivery_id);
                Err(e)
            }
        }
    }

    async fn route(&self, event: &InboundEvent) -> Result<IngestOutcome, EngineError> {
        if event.event_type == TriggerType::Dm
            && let Some(text) = &event.text
            && let Some(state) = self.resume_reply(event, text).await?
        {
            return Ok(IngestOutcome::Resumed(state));
        }

        let candidates = self
            .engine
            .flows()
            .list_active_flows(&event.channel_id, event.event_type)
            .await?;
        let Some(flow) = TriggerMatcher::select(event, candidates) else {
            debug!("no flow matched");
            return Ok(IngestOutcome::NoMatch);
        };

        info!(flow_id = %flow.id(), "flow matched");
        let outcome = self
            .engine
            .start(&flow, &event.external_user_id, TriggerContext::from_event(event))
            .await?;
        Ok(outcome.into())
    }

    /// Feeds a DM to the user's most recent conversation on this channel
    /// that waits on a free-text reply.
    async fn resume_reply(
        &self,
        event: &InboundEvent,
        text: &str,
    ) -> Result<Option<ConversationState>, EngineError> {
        let waiting = self
            .engine
            .conversations()
            .list(
                &ConversationFilter::all()
                    .user(event.external_user_id.clone())
                    .statuses([ConversationStatus::Waiting]),
            )
            .await?;
        let Some(target) = waiting
            .into_iter()
            .filter(|state| {
                state.trigger.channel_id == event.channel_id
                    && matches!(state.waiting_on, Some(WaitingOn::Reply { .. }))
            })
            .max_by_key(|state| state.last_activity_at)
        else {
            return Ok(None);
        };

        let outcome = self
            .engine
            .resume(
                target.key.flow_id,
                &event.external_user_id,
                ResumeInput::Reply {
                    text: text.to_string(),
                },
            )
            .await?;
        Ok(match outcome {
            ResumeOutcome::Resumed(state) => Some(state),
            ResumeOutcome::Ignored(reason) => {
                debug!(?reason, "waiting conversation moved on, matching triggers instead");
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{Harness, bootcamp_flow, comment};
    use crate::error::FlowStoreError;
    use crate::store::FlowStore;
    use async_trait::async_trait;
    use replyflow_conversation::ConversationStateStore;
    use replyflow_core::WorkspaceId;
    use replyflow_flow::{Edge, Flow, FunnelMetric, MessageNode, Node, PublishedFlow, TriggerRule};

    fn router(harness: &Harness) -> EventRouter {
        EventRouter::new(Arc::clone(&harness.engine), DeliveryDedup::default())
    }

    #[tokio::test]
    async fn comment_then_button_tap() {
        let harness = Harness::new();
        let flow = harness.publish(bootcamp_flow()).await;
        let router = router(&harness);

        let outcome = router
            .handle_event(&comment("love this bootcamp!", "user-1", "d-1"))
            .await
            .expect("event");
        let IngestOutcome::Started(state) = outcome else {
            panic!("expected Started, got {outcome:?}");
        };
        assert_eq!(state.status, ConversationStatus::Waiting);
        assert_eq!(harness.stat(flow.id(), FunnelMetric::TotalTriggered).await, 1);
        assert_eq!(harness.stat(flow.id(), FunnelMetric::OpeningMsgSent).await, 1);

        let outcome = router
            .handle_postback(Postback {
                flow_id: flow.id(),
                external_user_id: "user-1".to_string(),
                input: ResumeInput::ButtonTap { handle: 0 },
                delivery_id: "p-1".to_string(),
            })
            .await
            .expect("postback");
        let IngestOutcome::Resumed(state) = outcome else {
            panic!("expected Resumed, got {outcome:?}");
        };
        assert_eq!(state.status, ConversationStatus::Completed);
        assert_eq!(harness.stat(flow.id(), FunnelMetric::LinkMsgSent).await, 1);
    }

    #[tokio::test]
    async fn inactive_flow_does_not_match() {
        let harness = Harness::new();
        let flow = harness.publish(bootcamp_flow().with_active(false)).await;
        let router = router(&harness);

        let outcome = router
            .handle_event(&comment("love this bootcamp!", "user-1", "d-1"))
            .await
            .expect("event");
        assert_eq!(outcome, IngestOutcome::NoMatch);
        assert!(harness.conversation(flow.id(), "user-1").await.is_none());
        assert!(harness.gateway.sent().is_empty());
    }

    #[tokio::test]
    async fn duplicate_delivery_dispatches_once() {
        let harness = Harness::new();
        let flow = harness.publish(bootcamp_flow()).await;
        let router = router(&harness);
        let event = comment("love this bootcamp!", "user-1", "d-1");

        let first = router.handle_event(&event).await.expect("event");
        assert!(matches!(first, IngestOutcome::Started(_)));
        let second = router.handle_event(&event).await.expect("event");
        assert_eq!(second, IngestOutcome::Duplicate);

        assert_eq!(harness.gateway.direct_messages().len(), 1);
        let conversations = harness
            .conversations
            .list(&ConversationFilter::all().flow(flow.id()))
            .await
            .expect("list");
        assert_eq!(conversations.len(), 1);
    }

    #[tokio::test]
    async fn total_triggered_counts_distinct_conversations() {
        let harness = Harness::new();
        let flow = harness.publish(bootcamp_flow()).await;
        let router = router(&harness);

        let deliveries = [
            ("user-1", "d-1"),
            ("user-1", "d-1"),
            ("user-1", "d-2"),
            ("user-2", "d-3"),
            ("user-2", "d-3"),
        ];
        for (user, delivery) in deliveries {
            router
                .handle_event(&comment("bootcamp", user, delivery))
                .await
                .expect("event");
        }

        assert_eq!(harness.stat(flow.id(), FunnelMetric::TotalTriggered).await, 2);
        assert_eq!(harness.gateway.direct_messages().len(), 2);
    }

    #[tokio::test]
    async fn dm_reply_resumes_capture() {
        let harness = Harness::new();
        let flow = harness
            .publish(
                Flow::new(
                    WorkspaceId::new(),
                    "chan",
                    "email",
                    TriggerRule::specific(TriggerType::Comment, ["guide"]),
                )
                .with_node(Node::trigger("t"))
                .with_node(Node::message(
                    "ask",
                    MessageNode::text("What's your email?").with_capture("email", None),
                ))
                .with_node(Node::message("done", MessageNode::text("Sent to {{email}}")))
                .with_edge(Edge::new("e1", "t", "ask"))
                .with_edge(Edge::new("e2", "ask", "done")),
            )
            .await;
        let router = router(&harness);
        router
            .handle_event(&comment("send the guide", "user-1", "d-1"))
            .await
            .expect("event");

        let mut reply = comment("ada@example.com", "user-1", "d-2");
        reply.event_type = TriggerType::Dm;
        reply.comment_id = None;
        let outcome = router.handle_event(&reply).await.expect("event");
        let IngestOutcome::Resumed(state) = outcome else {
            panic!("expected Resumed, got {outcome:?}");
        };
        assert_eq!(state.key.flow_id, flow.id());
        assert_eq!(state.status, ConversationStatus::Completed);
        assert_eq!(
            harness.gateway.direct_messages()[1].content,
            "Sent to ada@example.com"
        );
    }

    #[tokio::test]
    async fn dm_without_waiting_conversation_matches_triggers() {
        let harness = Harness::new();
        let router = router(&harness);
        let mut dm = comment("hello", "user-1", "d-1");
        dm.event_type = TriggerType::Dm;

        let outcome = router.handle_event(&dm).await.expect("event");
        assert_eq!(outcome, IngestOutcome::NoMatch);
    }

    struct DownFlowStore;

    #[async_trait]
    impl FlowStore for DownFlowStore {
        async fn list_active_flows(
            &self,
            _channel_id: &str,
            _event_type: TriggerType,
        ) -> Result<Vec<Arc<PublishedFlow>>, FlowStoreError> {
            Err(FlowStoreError::Backend {
                message: "connection refused".to_string(),
            })
        }

        async fn get(
            &self,
            _flow_id: FlowId,
        ) -> Result<Option<Arc<PublishedFlow>>, FlowStoreError> {
            Ok(None)
        }

        async fn publish(&self, _flow: PublishedFlow) -> Result<(), FlowStoreError> {
            Ok(())
        }

        async fn set_active(
            &self,
            _flow_id: FlowId,
            _is_active: bool,
        ) -> Result<bool, FlowStoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn failed_delivery_can_be_retried() {
        use crate::engine::{EngineConfig, ExecutionEngine};
        use crate::gateway::DryRunGateway;
        use crate::stats::InMemoryStatsStore;
        use crate::timer::testing::RecordingScheduler;
        use replyflow_conversation::InMemoryConversationStore;

        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(DownFlowStore),
            Arc::new(InMemoryConversationStore::new()),
            Arc::new(DryRunGateway::new()),
            Arc::new(InMemoryStatsStore::new()),
            Arc::new(RecordingScheduler::default()),
            EngineConfig::default(),
        ));
        let router = EventRouter::new(engine, DeliveryDedup::default());
        let event = comment("bootcamp", "user-1", "d-1");

        assert!(router.handle_event(&event).await.is_err());
        // Not reported as a duplicate: the delivery was forgotten.
        assert!(router.handle_event(&event).await.is_err());
    }
}
