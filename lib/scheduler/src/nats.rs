//! NATS JetStream key-value timer store.
//!
//! Timers live in their own bucket next to the conversation bucket, keyed by
//! timer ID, so a restarted process picks up every pending timer. Settled
//! timers are purged, so the bucket only ever holds pending ones.

use crate::error::TimerError;
use crate::timer::{Timer, TimerStore};
use async_nats::jetstream;
use async_nats::jetstream::kv;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use replyflow_conversation::envelope::Envelope;
use replyflow_core::TimerId;
use tracing::{debug, instrument};

/// Default bucket name for timers.
pub const TIMERS_BUCKET: &str = "replyflow-timers";

/// Timer store backed by a JetStream KV bucket.
pub struct NatsTimerStore {
    store: kv::Store,
}

impl NatsTimerStore {
    /// Opens (creating if needed) the timer bucket.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket cannot be created or opened.
    pub async fn new(jetstream: &jetstream::Context, bucket: &str) -> Result<Self, TimerError> {
        let store = jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| TimerError::StorageFailed {
                reason: format!("failed to create timer bucket: {e}"),
            })?;

        Ok(Self { store })
    }

    async fn load(&self, key: &str) -> Result<Option<Timer>, TimerError> {
        let entry = self
            .store
            .entry(key)
            .await
            .map_err(|e| TimerError::StorageFailed {
                reason: e.to_string(),
            })?;
        entry
            .filter(|e| matches!(e.operation, kv::Operation::Put))
            .map(|e| -> Result<Timer, TimerError> {
                Ok(Envelope::<Timer>::from_json_bytes(&e.value)?.into_payload())
            })
            .transpose()
    }

    async fn save(&self, timer: &Timer) -> Result<(), TimerError> {
        let bytes = Envelope::new(timer).to_json_bytes()?;
        let revision = self
            .store
            .put(timer.id.to_string(), bytes.into())
            .await
            .map_err(|e| TimerError::StorageFailed {
                reason: e.to_string(),
            })?;
        debug!(timer_id = %timer.id, revision, "timer persisted");
        Ok(())
    }

    async fn purge(&self, id: TimerId) -> Result<(), TimerError> {
        self.store
            .purge(id.to_string())
            .await
            .map_err(|e| TimerError::StorageFailed {
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl TimerStore for NatsTimerStore {
    #[instrument(skip(self, timer), fields(timer_id = %timer.id, conversation = %timer.key))]
    async fn insert(&self, timer: &Timer) -> Result<(), TimerError> {
        self.save(timer).await
    }

    async fn get(&self, id: TimerId) -> Result<Timer, TimerError> {
        self.load(&id.to_string())
            .await?
            .ok_or(TimerError::NotFound { id })
    }

    #[instrument(skip(self), fields(timer_id = %id))]
    async fn cancel(&self, id: TimerId) -> Result<bool, TimerError> {
        if self.load(&id.to_string()).await?.is_none() {
            return Ok(false);
        }
        self.purge(id).await?;
        Ok(true)
    }

    async fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Timer>, TimerError> {
        let mut keys = self.store.keys().await.map_err(|e| TimerError::StorageFailed {
            reason: format!("failed to list timer keys: {e}"),
        })?;

        let mut due = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| TimerError::StorageFailed {
                reason: e.to_string(),
            })?;
            if let Some(timer) = self.load(&key).await?
                && timer.is_due(now)
            {
                due.push(timer);
            }
        }
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn record_attempt(&self, id: TimerId) -> Result<(), TimerError> {
        let mut timer = self.get(id).await?;
        timer.attempts = timer.attempts.saturating_add(1);
        self.save(&timer).await
    }

    #[instrument(skip(self), fields(timer_id = %id))]
    async fn mark_fired(&self, id: TimerId) -> Result<(), TimerError> {
        self.purge(id).await?;
        debug!("timer purged");
        Ok(())
    }
}
