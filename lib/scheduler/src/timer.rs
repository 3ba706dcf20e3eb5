//! Durable timers for DELAY nodes.
//!
//! A timer is written when a conversation suspends on a DELAY node and
//! removed once the engine has accepted (or ignored) the resume, or when the
//! wait is cancelled. Only pending timers are ever stored. A crash between
//! the resume and the removal fires the timer again; the engine drops the
//! second delivery as a stale timer.

use crate::error::TimerError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replyflow_conversation::ConversationKey;
use replyflow_core::TimerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A persisted timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timer {
    /// Unique identifier; echoed back to the engine when firing.
    pub id: TimerId,
    /// Conversation to resume.
    pub key: ConversationKey,
    /// When the timer is due.
    pub fire_at: DateTime<Utc>,
    /// Delivery attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// When the timer was scheduled.
    pub created_at: DateTime<Utc>,
}

impl Timer {
    /// Creates a pending timer.
    #[must_use]
    pub fn new(key: ConversationKey, fire_at: DateTime<Utc>) -> Self {
        Self {
            id: TimerId::new(),
            key,
            fire_at,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Checks if the timer should fire at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.fire_at <= now
    }
}

/// Storage for timers.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Persists a new timer.
    async fn insert(&self, timer: &Timer) -> Result<(), TimerError>;

    /// Gets a pending timer by ID.
    ///
    /// # Errors
    ///
    /// Returns `TimerError::NotFound` once the timer fired or was cancelled.
    async fn get(&self, id: TimerId) -> Result<Timer, TimerError>;

    /// Removes a pending timer. Returns false if it had already settled.
    async fn cancel(&self, id: TimerId) -> Result<bool, TimerError>;

    /// Timers due at or before `now`, earliest first, at most `limit`.
    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerError>;

    /// Counts one delivery attempt.
    async fn record_attempt(&self, id: TimerId) -> Result<(), TimerError>;

    /// Removes a delivered timer. Settled timers are not an error.
    async fn mark_fired(&self, id: TimerId) -> Result<(), TimerError>;
}

/// Process-local timer store.
#[derive(Debug, Default)]
pub struct InMemoryTimerStore {
    timers: Mutex<HashMap<TimerId, Timer>>,
}

impl InMemoryTimerStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<TimerId, Timer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl TimerStore for InMemoryTimerStore {
    async fn insert(&self, timer: &Timer) -> Result<(), TimerError> {
        self.timers().insert(timer.id, timer.clone());
        Ok(())
    }

    async fn get(&self, id: TimerId) -> Result<Timer, TimerError> {
        self.timers()
            .get(&id)
            .cloned()
            .ok_or(TimerError::NotFound { id })
    }

    async fn cancel(&self, id: TimerId) -> Result<bool, TimerError> {
        Ok(self.timers().remove(&id).is_some())
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerError> {
        let mut due: Vec<_> = self
            .timers()
            .values()
            .filter(|timer| timer.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn record_attempt(&self, id: TimerId) -> Result<(), TimerError> {
        let mut timers = self.timers();
        let timer = timers.get_mut(&id).ok_or(TimerError::NotFound { id })?;
        timer.attempts = timer.attempts.saturating_add(1);
        Ok(())
    }

    async fn mark_fired(&self, id: TimerId) -> Result<(), TimerError> {
        self.timers().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use replyflow_core::FlowId;

    fn timer(offset: Duration) -> Timer {
        Timer::new(
            ConversationKey::new(FlowId::new(), "user-1"),
            Utc::now() + offset,
        )
    }

    #[test]
    fn serde_uses_wire_names() {
        let timer = timer(Duration::minutes(5));
        let json = serde_json::to_value(&timer).expect("serialize");
        assert!(json.get("fireAt").is_some());
        assert_eq!(json["attempts"], 0);
    }

    #[tokio::test]
    async fn due_returns_earliest_first() {
        let store = InMemoryTimerStore::new();
        let later = timer(Duration::minutes(-1));
        let earlier = timer(Duration::minutes(-10));
        let future = timer(Duration::hours(1));
        let cancelled = timer(Duration::minutes(-5));
        for t in [&later, &earlier, &future, &cancelled] {
            store.insert(t).await.expect("insert");
        }
        assert!(store.cancel(cancelled.id).await.expect("cancel"));
        assert!(!store.cancel(cancelled.id).await.expect("cancel"));

        let due = store.due(Utc::now(), 10).await.expect("due");
        let ids: Vec<_> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![earlier.id, later.id]);

        let limited = store.due(Utc::now(), 1).await.expect("due");
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn fired_timer_leaves_storage() {
        let store = InMemoryTimerStore::new();
        let t = timer(Duration::minutes(-1));
        store.insert(&t).await.expect("insert");

        store.record_attempt(t.id).await.expect("attempt");
        assert_eq!(store.get(t.id).await.expect("get").attempts, 1);

        store.mark_fired(t.id).await.expect("fire");
        assert!(matches!(
            store.get(t.id).await,
            Err(TimerError::NotFound { .. })
        ));
        assert!(store.due(Utc::now(), 10).await.expect("due").is_empty());
        assert!(!store.cancel(t.id).await.expect("cancel"));

        // Redelivery after a crash settles the same timer twice.
        store.mark_fired(t.id).await.expect("fire again");
        let missing = store.record_attempt(TimerId::new()).await.unwrap_err();
        assert!(matches!(missing, TimerError::NotFound { .. }));
    }
}
