//! Per-flow funnel counters.
//!
//! Counting is two-phase. During a step the engine *claims* a metric by
//! tagging the step log entry; once the state write commits, the claimed
//! metrics are *recorded* as atomic increments. A step that loses a CAS race
//! never records, and a replayed step finds its claim already in the log.

use crate::error::StatsError;
use async_trait::async_trait;
use replyflow_conversation::ConversationState;
use replyflow_core::FlowId;
use replyflow_flow::FunnelMetric;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{instrument, warn};

/// Durable funnel counters keyed by (flow, metric).
#[async_trait]
pub trait StatsStore: Send + Sync {
    /// Atomically adds one to the counter.
    async fn increment(&self, flow_id: FlowId, metric: FunnelMetric) -> Result<(), StatsError>;

    /// Returns the counters recorded for the flow. Missing metrics are absent.
    async fn snapshot(&self, flow_id: FlowId)
    -> Result<BTreeMap<FunnelMetric, u64>, StatsError>;
}

/// Process-local counters.
#[derive(Debug, Default)]
pub struct InMemoryStatsStore {
    counters: RwLock<HashMap<(FlowId, FunnelMetric), Arc<AtomicU64>>>,
}

impl InMemoryStatsStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, flow_id: FlowId, metric: FunnelMetric) -> Arc<AtomicU64> {
        if let Some(counter) = self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(flow_id, metric))
        {
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(counters.entry((flow_id, metric)).or_default())
    }
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn increment(&self, flow_id: FlowId, metric: FunnelMetric) -> Result<(), StatsError> {
        self.counter(flow_id, metric).fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn snapshot(
        &self,
        flow_id: FlowId,
    ) -> Result<BTreeMap<FunnelMetric, u64>, StatsError> {
        Ok(self
            .counters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((id, _), _)| *id == flow_id)
            .map(|((_, metric), count)| (*metric, count.load(Ordering::Relaxed)))
            .collect())
    }
}

/// Records funnel milestones at most once per conversation.
#[derive(Clone)]
pub struct StatsRecorder {
    store: Arc<dyn StatsStore>,
}

impl StatsRecorder {
    /// Creates a recorder over the given store.
    #[must_use]
    pub fn new(store: Arc<dyn StatsStore>) -> Self {
        Self { store }
    }

    /// Claims `metric` for this conversation.
    ///
    /// Returns true if the metric was not yet counted; the caller must then
    /// `record` it once the state is persisted.
    pub fn claim(&self, state: &mut ConversationState, metric: FunnelMetric) -> bool {
        state.claim_metric(metric)
    }

    /// Increments the counter for a claimed metric.
    ///
    /// Failures are logged, not returned: the conversation has already moved
    /// on and the claim cannot be rolled back.
    #[instrument(skip(self), fields(flow_id = %flow_id, metric = %metric))]
    pub async fn record(&self, flow_id: FlowId, metric: FunnelMetric) {
        if let Err(e) = self.store.increment(flow_id, metric).await {
            warn!(error = %e, "failed to record funnel metric");
        }
    }

    /// Returns every metric for the flow, reporting 0 for those never hit.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be read.
    pub async fn get_stats(
        &self,
        flow_id: FlowId,
    ) -> Result<BTreeMap<FunnelMetric, u64>, StatsError> {
        let recorded = self.store.snapshot(flow_id).await?;
        Ok(FunnelMetric::ALL
            .into_iter()
            .map(|metric| (metric, recorded.get(&metric).copied().unwrap_or(0)))
            .collect())
    }
}
