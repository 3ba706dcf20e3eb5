//! Messaging gateway port.
//!
//! The gateway is the only way the engine talks to a social platform. Every
//! call carries an idempotency key; a gateway that sees the same key twice
//! must return the original result instead of sending again.

use crate::error::GatewayError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::info;

/// A button attached to an outbound direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundButton {
    /// Label shown to the user.
    pub label: String,
    /// Link opened by the button, if any.
    #[serde(default)]
    pub url: Option<String>,
    /// Button index, echoed back in the postback when tapped.
    pub handle: usize,
}

/// A direct message to one end user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectMessage {
    pub channel_id: String,
    pub external_user_id: String,
    pub content: String,
    #[serde(default)]
    pub buttons: Vec<OutboundButton>,
    pub idempotency_key: String,
}

/// A public reply under a comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentReply {
    pub channel_id: String,
    pub comment_id: String,
    pub content: String,
    pub idempotency_key: String,
}

/// Outbound calls to a social messaging platform.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    /// Sends a direct message, returning the platform message ID.
    async fn send_direct_message(&self, message: &DirectMessage) -> Result<String, GatewayError>;

    /// Replies to a comment, returning the platform reply ID.
    async fn reply_to_comment(&self, reply: &CommentReply) -> Result<String, GatewayError>;
}

/// A call recorded by the dry-run gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    DirectMessage(DirectMessage),
    CommentReply(CommentReply),
}

#[derive(Debug, Default)]
struct DryRunLog {
    sent: Vec<Outbound>,
    ids_by_key: HashMap<String, String>,
}

/// Gateway that logs and records calls without touching the network.
///
/// Honors idempotency keys the way a real gateway must: a repeated key
/// returns the first call's ID and is not recorded again.
#[derive(Debug, Default)]
pub struct DryRunGateway {
    log: Mutex<DryRunLog>,
}

impl DryRunGateway {
    /// Creates an empty dry-run gateway.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every distinct call made so far, in order.
    #[must_use]
    pub fn sent(&self) -> Vec<Outbound> {
        self.log().sent.clone()
    }

    /// Returns the direct messages sent so far.
    #[must_use]
    pub fn direct_messages(&self) -> Vec<DirectMessage> {
        self.log()
            .sent
            .iter()
            .filter_map(|outbound| match outbound {
                Outbound::DirectMessage(message) => Some(message.clone()),
                Outbound::CommentReply(_) => None,
            })
            .collect()
    }

    fn log(&self) -> MutexGuard<'_, DryRunLog> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, key: &str, outbound: Outbound) -> String {
        let mut log = self.log();
        if let Some(id) = log.ids_by_key.get(key) {
            return id.clone();
        }
        let id = format!("dry-run-{}", log.sent.len() + 1);
        log.ids_by_key.insert(key.to_string(), id.clone());
        log.sent.push(outbound);
        id
    }
}

#[async_trait]
impl MessagingGateway for DryRunGateway {
    async fn send_direct_message(&self, message: &DirectMessage) -> Result<String, GatewayError> {
        info!(
            channel_id = %message.channel_id,
            external_user_id = %message.external_user_id,
            idempotency_key = %message.idempotency_key,
            buttons = message.buttons.len(),
            "dry run: direct message"
        );
        Ok(self.record(
            &message.idempotency_key,
            Outbound::DirectMessage(message.clone()),
        ))
    }

    async fn reply_to_comment(&self, reply: &CommentReply) -> Result<String, GatewayError> {
        info!(
            channel_id = %reply.channel_id,
            comment_id = %reply.comment_id,
            idempotency_key = %reply.idempotency_key,
            "dry run: comment reply"
        );
        Ok(self.record(&reply.idempotency_key, Outbound::CommentReply(reply.clone())))
    }
}
