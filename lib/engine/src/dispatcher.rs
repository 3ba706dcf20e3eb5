//! Action dispatch.
//!
//! The dispatcher turns one node into at most one outbound gateway call and
//! retries transient failures under the same idempotency key. It never
//! touches the step log: the engine records the step only after a dispatch
//! succeeds, so a retried or replayed dispatch is always safe.

use crate::error::GatewayError;
use crate::gateway::{CommentReply, DirectMessage, MessagingGateway, OutboundButton};
use replyflow_conversation::{ConversationState, DispatchKey};
use replyflow_flow::{ActionKind, Node, NodeKind, render_template};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Bounded exponential backoff for transient gateway errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay after the given failed attempt (1-based).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// What a successful dispatch did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// A direct message went out.
    Sent { message_id: String },
    /// A comment reply went out.
    Replied { reply_id: String },
    /// A variable should be set; nothing went out.
    VariableSet { name: String, value: String },
    /// The node kind has no outbound action.
    NoOp,
}

/// Translates nodes into gateway calls.
pub struct ActionDispatcher {
    gateway: Arc<dyn MessagingGateway>,
    retry: RetryPolicy,
}

impl ActionDispatcher {
    /// Creates a dispatcher over the given gateway.
    #[must_use]
    pub fn new(gateway: Arc<dyn MessagingGateway>, retry: RetryPolicy) -> Self {
        Self { gateway, retry }
    }

    /// Performs the node's outbound action for `state` under `key`.
    ///
    /// # Errors
    ///
    /// Returns the permanent error, or the last transient error once the
    /// retry policy is exhausted.
    #[instrument(skip(self, node, state), fields(node_id = %node.id, dedup_key = %key))]
    pub async fn dispatch(
        &self,
        node: &Node,
        state: &ConversationState,
        key: &DispatchKey,
    ) -> Result<Effect, GatewayError> {
        let idempotency_key = key.to_string();
        let channel_id = &state.trigger.channel_id;
        match &node.kind {
            NodeKind::Message(message) => {
                let outbound = DirectMessage {
                    channel_id: channel_id.clone(),
                    external_user_id: state.key.external_user_id.clone(),
                    content: render_template(&message.text, &state.variables),
                    buttons: message
                        .buttons
                        .iter()
                        .enumerate()
                        .map(|(handle, button)| OutboundButton {
                            label: render_template(&button.label, &state.variables),
                            url: button.url.clone(),
                            handle,
                        })
                        .collect(),
                    idempotency_key,
                };
                let message_id = self
                    .with_retry(|| self.gateway.send_direct_message(&outbound))
                    .await?;
                Ok(Effect::Sent { message_id })
            }
            NodeKind::Action(action) => match &action.action {
                ActionKind::ReplyToComment { text } => {
                    let comment_id = state.trigger.comment_id.clone().ok_or_else(|| {
                        GatewayError::Permanent {
                            message: "trigger event carries no comment id".to_string(),
                        }
                    })?;
                    let reply = CommentReply {
                        channel_id: channel_id.clone(),
                        comment_id,
                        content: render_template(text, &state.variables),
                        idempotency_key,
                    };
                    let reply_id = self
                        .with_retry(|| self.gateway.reply_to_comment(&reply))
                        .await?;
                    Ok(Effect::Replied { reply_id })
                }
                ActionKind::SendDirectMessage { text } => {
                    let outbound = DirectMessage {
                        channel_id: channel_id.clone(),
                        external_user_id: state.key.external_user_id.clone(),
                        content: render_template(text, &state.variables),
                        buttons: Vec::new(),
                        idempotency_key,
                    };
                    let message_id = self
                        .with_retry(|| self.gateway.send_direct_message(&outbound))
                        .await?;
                    Ok(Effect::Sent { message_id })
                }
                ActionKind::SetVariable { name, value } => Ok(Effect::VariableSet {
                    name: name.clone(),
                    value: render_template(value, &state.variables),
                }),
            },
            NodeKind::Trigger(_) | NodeKind::Condition(_) | NodeKind::Delay(_) => Ok(Effect::NoOp),
        }
    }

    async fn with_retry<F, Fut>(&self, mut call: F) -> Result<String, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<String, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(id) => {
                    debug!(attempt, "dispatch succeeded");
                    return Ok(id);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(attempt, ?delay, error = %e, "transient gateway error, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
