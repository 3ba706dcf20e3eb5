//! Conversation state storage.
//!
//! `put` is a compare-and-swap on `ConversationState::version`: the write
//! succeeds only if the stored revision still equals the revision the caller
//! read (0 for a conversation that was never persisted). This is what keeps
//! two processes from interleaving steps of the same conversation.

use crate::error::StoreError;
use crate::state::{ConversationKey, ConversationState, ConversationStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replyflow_core::FlowId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Selects conversations for sweeps and operator actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationFilter {
    /// Only conversations of this flow.
    pub flow_id: Option<FlowId>,
    /// Only conversations with this end user.
    pub external_user_id: Option<String>,
    /// Only these statuses; empty means any.
    pub statuses: Vec<ConversationStatus>,
    /// Only conversations whose last activity is at or before this instant.
    pub idle_before: Option<DateTime<Utc>>,
}

impl ConversationFilter {
    /// Matches every conversation.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts to one flow.
    #[must_use]
    pub fn flow(mut self, flow_id: FlowId) -> Self {
        self.flow_id = Some(flow_id);
        self
    }

    /// Restricts to one end user.
    #[must_use]
    pub fn user(mut self, external_user_id: impl Into<String>) -> Self {
        self.external_user_id = Some(external_user_id.into());
        self
    }

    /// Restricts to the given statuses.
    #[must_use]
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = ConversationStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// Restricts to conversations idle since `before`.
    #[must_use]
    pub fn idle_before(mut self, before: DateTime<Utc>) -> Self {
        self.idle_before = Some(before);
        self
    }

    /// Returns whether `state` passes the filter.
    #[must_use]
    pub fn matches(&self, state: &ConversationState) -> bool {
        self.flow_id.is_none_or(|id| id == state.key.flow_id)
            && self
                .external_user_id
                .as_ref()
                .is_none_or(|user| *user == state.key.external_user_id)
            && (self.statuses.is_empty() || self.statuses.contains(&state.status))
            && self
                .idle_before
                .is_none_or(|before| state.last_activity_at <= before)
    }
}

/// Durable storage for conversation state.
#[async_trait]
pub trait ConversationStateStore: Send + Sync {
    /// Loads a conversation, with `version` set to its stored revision.
    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationState>, StoreError>;

    /// Writes a conversation if its stored revision still equals
    /// `state.version`, returning the new revision.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Conflict` if another writer got there first.
    async fn put(&self, state: &ConversationState) -> Result<u64, StoreError>;

    /// Lists conversations passing the filter.
    async fn list(&self, filter: &ConversationFilter)
    -> Result<Vec<ConversationState>, StoreError>;
}

/// Process-local conversation store.
///
/// Used by tests and single-node dry runs.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    states: Mutex<HashMap<ConversationKey, ConversationState>>,
}

impl InMemoryConversationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn states(&self) -> MutexGuard<'_, HashMap<ConversationKey, ConversationState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ConversationStateStore for InMemoryConversationStore {
    async fn get(&self, key: &ConversationKey) -> Result<Option<ConversationState>, StoreError> {
        Ok(self.states().get(key).cloned())
    }

    async fn put(&self, state: &ConversationState) -> Result<u64, StoreError> {
        let mut states = self.states();
        let actual = states.get(&state.key).map(|stored| stored.version);
        if actual.unwrap_or(0) != state.version {
            return Err(StoreError::Conflict {
                key: state.key.clone(),
                expected: state.version,
                actual,
            });
        }

        let mut stored = state.clone();
        stored.version = state.version + 1;
        let version = stored.version;
        states.insert(stored.key.clone(), stored);
        Ok(version)
    }

    async fn list(
        &self,
        filter: &ConversationFilter,
    ) -> Result<Vec<ConversationState>, StoreError> {
        let mut matched: Vec<_> = self
            .states()
            .values()
            .filter(|state| filter.matches(state))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(matched)
    }
}
