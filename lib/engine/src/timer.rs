//! Timer scheduling port.
//!
//! DELAY nodes suspend a conversation on a durable timer. The engine only
//! schedules and cancels; firing is the scheduler's job, which calls back
//! into `ExecutionEngine::resume` with the timer ID.

use crate::error::SchedulingError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replyflow_conversation::ConversationKey;
use replyflow_core::TimerId;

/// Durable timers for DELAY nodes.
#[async_trait]
pub trait TimerScheduler: Send + Sync {
    /// Persists a timer that resumes `key` at `fire_at`.
    async fn schedule(
        &self,
        key: &ConversationKey,
        fire_at: DateTime<Utc>,
    ) -> Result<TimerId, SchedulingError>;

    /// Cancels a pending timer. Cancelling a fired or unknown timer is a no-op.
    async fn cancel(&self, timer_id: TimerId) -> Result<(), SchedulingError>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Records scheduled timers without ever firing them.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingScheduler {
        pub(crate) pending: Mutex<BTreeMap<TimerId, (ConversationKey, DateTime<Utc>)>>,
        pub(crate) cancelled: Mutex<Vec<TimerId>>,
    }

    impl RecordingScheduler {
        pub(crate) fn pending(&self) -> Vec<(TimerId, ConversationKey, DateTime<Utc>)> {
            self.pending
                .lock()
                .unwrap()
                .iter()
                .map(|(id, (key, at))| (*id, key.clone(), *at))
                .collect()
        }

        pub(crate) fn cancelled(&self) -> Vec<TimerId> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TimerScheduler for RecordingScheduler {
        async fn schedule(
            &self,
            key: &ConversationKey,
            fire_at: DateTime<Utc>,
        ) -> Result<TimerId, SchedulingError> {
            let id = TimerId::new();
            self.pending
                .lock()
                .unwrap()
                .insert(id, (key.clone(), fire_at));
            Ok(id)
        }

        async fn cancel(&self, timer_id: TimerId) -> Result<(), SchedulingError> {
            if self.pending.lock().unwrap().remove(&timer_id).is_some() {
                self.cancelled.lock().unwrap().push(timer_id);
            }
            Ok(())
        }
    }
}
