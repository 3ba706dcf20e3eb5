//! The engine's timer port, backed by a `TimerStore`.

use crate::timer::{Timer, TimerStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replyflow_conversation::ConversationKey;
use replyflow_core::TimerId;
use replyflow_engine::{SchedulingError, TimerScheduler};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Persists DELAY timers so they survive restarts.
#[derive(Clone)]
pub struct DurableScheduler {
    store: Arc<dyn TimerStore>,
}

impl DurableScheduler {
    /// Creates a scheduler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn TimerStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TimerScheduler for DurableScheduler {
    #[instrument(skip(self), fields(conversation = %key))]
    async fn schedule(
        &self,
        key: &ConversationKey,
        fire_at: DateTime<Utc>,
    ) -> Result<TimerId, SchedulingError> {
        let timer = Timer::new(key.clone(), fire_at);
        self.store.insert(&timer).await?;
        debug!(timer_id = %timer.id, %fire_at, "timer scheduled");
        Ok(timer.id)
    }

    #[instrument(skip(self), fields(timer_id = %timer_id))]
    async fn cancel(&self, timer_id: TimerId) -> Result<(), SchedulingError> {
        let cancelled = self.store.cancel(timer_id).await?;
        debug!(cancelled, "timer cancel requested");
        Ok(())
    }
}
