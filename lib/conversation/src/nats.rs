//! NATS JetStream key-value conversation store.
//!
//! Each conversation is one KV entry. The entry revision doubles as the
//! conversation version, so compare-and-swap maps directly onto KV
//! `create` (version 0) and `update` (version = expected revision).
//!
//! Keys are `<flow_id>.<hex(external_user_id)>`: platform user IDs may carry
//! characters KV keys reject, hex keeps them opaque and reversible.

use crate::envelope::Envelope;
use crate::error::StoreError;
use crate::state::{ConversationKey, ConversationState};
use crate::store::{ConversationFilter, ConversationStateStore};
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, instrument};

/// Default bucket name for conversation state.
pub const CONVERSATIONS_BUCKET: &str = "replyflow-conversations";

/// Conversation store backed by a JetStream KV bucket.
pub struct NatsConversationStore {
    store: kv::Store,
}

impl NatsConversationStore {
    /// Opens (creating if needed) the conversation bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket cannot be created or opened.
    pub async fn new(jetstream: &jetstream::Context, bucket: &str) -> Result<Self, StoreError> {
        let store = jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| StoreError::Backend {
                message: format!("failed to create conversation bucket: {e}"),
            })?;

        Ok(Self { store })
    }

    /// Returns the KV key for a conversation.
    fn entry_key(key: &ConversationKey) -> String {
        format!("{}.{}", key.flow_id, hex(&key.external_user_id))
    }

    /// Loads the live entry for `key`, ignoring delete markers.
    async fn entry(&self, key: &str) -> Result<Option<kv::Entry>, StoreError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?;
        Ok(entry.filter(|e| matches!(e.operation, kv::Operation::Put)))
    }

    fn decode(entry: kv::Entry) -> Result<ConversationState, StoreError> {
        let mut state = Envelope::<ConversationState>::from_json_bytes(&entry.value)?.into_payload();
        state.version = entry.revision;
        Ok(state)
    }

    /// Turns a failed write into a conflict when the revision moved.
    async fn classify_write_error(
        &self,
        key: &str,
        state: &ConversationState,
        message: String,
    ) -> StoreError {
        match self.entry(key).await {
            Ok(entry) => {
                let actual = entry.map(|e| e.revision);
                if actual.unwrap_or(0) != state.version {
                    StoreError::Conflict {
                        key: state.key.clone(),
                        expected: state.version,
                        actual,
                    }
                } else {
                    StoreError::Backend { message }
                }
            }
            Err(_) => StoreError::Backend { message },
        }
    }
}

#[async_trait]
impl ConversationStateStore for NatsConversationStore {
    #[instrument(skip(self), fields(conversation = %key))]
    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationState>, StoreError> {
        self.entry(&Self::entry_key(key))
            .await?
            .map(Self::decode)
            .transpose()
    }

    #[instrument(skip(self, state), fields(conversation = %state.key, version = state.version))]
    async fn put(&self, state: &ConversationState) -> Result<u64, StoreError> {
        let key = Self::entry_key(&state.key);
        let bytes = Envelope::new(state).to_json_bytes()?;

        let written = if state.version == 0 {
            self.store
                .create(&key, bytes.into())
                .await
                .map_err(|e| e.to_string())
        } else {
            self.store
                .update(&key, bytes.into(), state.version)
                .await
                .map_err(|e| e.to_string())
        };

        match written {
            Ok(revision) => {
                debug!(revision, "conversation persisted");
                Ok(revision)
            }
            Err(message) => Err(self.classify_write_error(&key, state, message).await),
        }
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationState>, StoreError> {
        let prefix = filter.flow_id.map(|id| format!("{id}."));
        let suffix = filter
            .external_user_id
            .as_deref()
            .map(|user| format!(".{}", hex(user)));
        let mut keys = self.store.keys().await.map_err(|e| StoreError::Backend {
            message: format!("failed to list conversation keys: {e}"),
        })?;

        let mut states = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| StoreError::Backend {
                message: e.to_string(),
            })?;
            if prefix.as_deref().is_some_and(|p| !key.starts_with(p))
                || suffix.as_deref().is_some_and(|s| !key.ends_with(s))
            {
                continue;
            }
            let Some(entry) = self.entry(&key).await? else {
                continue;
            };
            let state = Self::decode(entry)?;
            if filter.matches(&state) {
                states.push(state);
            }
        }
        Ok(states)
    }
}

fn hex(value: &str) -> String {
    use std::fmt::Write;

    value
        .bytes()
        .fold(String::with_capacity(value.len() * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
}
