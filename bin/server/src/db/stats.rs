//! Postgres funnel counters.
//!
//! Increments are single upserts, so concurrent writers never lose counts.

use async_trait::async_trait;
use replyflow_core::FlowId;
use replyflow_engine::{StatsError, StatsStore};
use replyflow_flow::FunnelMetric;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tracing::{instrument, warn};

/// Row type for counter queries.
#[derive(FromRow)]
struct CounterRow {
    metric: String,
    count: i64,
}

fn backend(e: sqlx::Error) -> StatsError {
    StatsError::Backend {
        message: e.to_string(),
    }
}

/// Stats store backed by the `flow_stats` table.
#[derive(Debug, Clone)]
pub struct PgStatsStore {
    pool: PgPool,
}

impl PgStatsStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Converts counter rows to metrics, dropping names this build does not know.
fn collect_counters(rows: Vec<CounterRow>) -> BTreeMap<FunnelMetric, u64> {
    rows.into_iter()
        .filter_map(|row| match FunnelMetric::from_name(&row.metric) {
            Some(metric) => Some((metric, u64::try_from(row.count).unwrap_or(0))),
            None => {
                warn!(metric = %row.metric, "ignoring unknown metric");
                None
            }
        })
        .collect()
}

#[async_trait]
impl StatsStore for PgStatsStore {
    #[instrument(skip(self), fields(flow_id = %flow_id, metric = %metric))]
    async fn increment(&self, flow_id: FlowId, metric: FunnelMetric) -> Result<(), StatsError> {
        sqlx::query(
            r#"
            INSERT INTO flow_stats (flow_id, metric, count)
            VALUES ($1, $2, 1)
            ON CONFLICT (flow_id, metric) DO UPDATE
            SET count = flow_stats.count + 1
            "#,
        )
        .bind(flow_id.to_string())
        .bind(metric.as_str())
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    async fn snapshot(
        &self,
        flow_id: FlowId,
    ) -> Result<BTreeMap<FunnelMetric, u64>, StatsError> {
        let rows: Vec<CounterRow> = sqlx::query_as(
            r#"
            SELECT metric, count
            FROM flow_stats
            WHERE flow_id = $1
            "#,
        )
        .bind(flow_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        Ok(collect_counters(rows))
    }
}
