//! Postgres flow store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use replyflow_core::FlowId;
use replyflow_engine::{FlowStore, FlowStoreError};
use replyflow_flow::{Flow, PublishedFlow, TriggerType};
use sqlx::{FromRow, PgPool};
use std::sync::Arc;
use tracing::{instrument, warn};

/// Row type for flow queries.
#[derive(Debug, FromRow)]
struct FlowRow {
    id: String,
    is_active: bool,
    definition: serde_json::Value,
    updated_at: DateTime<Utc>,
}

impl FlowRow {
    /// Rebuilds the published flow, validating it again.
    fn try_into_published(self) -> Result<PublishedFlow, FlowStoreError> {
        let mut flow: Flow =
            serde_json::from_value(self.definition).map_err(|e| FlowStoreError::Backend {
                message: format!("invalid flow definition for '{}': {e}", self.id),
            })?;
        flow.is_active = self.is_active;
        flow.updated_at = self.updated_at;
        let flow_id = flow.id;
        flow.publish().map_err(|e| FlowStoreError::Invalid {
            flow_id,
            reason: e.to_string(),
        })
    }
}

fn backend(e: sqlx::Error) -> FlowStoreError {
    FlowStoreError::Backend {
        message: e.to_string(),
    }
}

/// Flow store backed by the `flows` table.
#[derive(Debug, Clone)]
pub struct PgFlowStore {
    pool: PgPool,
}

impl PgFlowStore {
    /// Creates a new store.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FlowStore for PgFlowStore {
    #[instrument(skip(self))]
    async fn list_active_flows(
        &self,
        channel_id: &str,
        event_type: TriggerType,
    ) -> Result<Vec<Arc<PublishedFlow>>, FlowStoreError> {
        let rows: Vec<FlowRow> = sqlx::query_as(
            r#"
            SELECT id, is_active, definition, updated_at
            FROM flows
            WHERE channel_id = $1 AND trigger_type = $2 AND is_active
            "#,
        )
        .bind(channel_id)
        .bind(event_type.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;

        // A flow that no longer validates is skipped so the others still match.
        Ok(rows
            .into_iter()
            .filter_map(|row| match row.try_into_published() {
                Ok(flow) => Some(Arc::new(flow)),
                Err(e) => {
                    warn!(error = %e, "skipping unloadable flow");
                    None
                }
            })
            .collect())
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn get(&self, flow_id: FlowId) -> Result<Option<Arc<PublishedFlow>>, FlowStoreError> {
        let row: Option<FlowRow> = sqlx::query_as(
            r#"
            SELECT id, is_active, definition, updated_at
            FROM flows
            WHERE id = $1
            "#,
        )
        .bind(flow_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;

        match row {
            Some(row) => Ok(Some(Arc::new(row.try_into_published()?))),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, flow), fields(flow_id = %flow.id()))]
    async fn publish(&self, flow: PublishedFlow) -> Result<(), FlowStoreError> {
        let definition = serde_json::to_value(&flow).map_err(|e| FlowStoreError::Backend {
            message: format!("failed to encode flow: {e}"),
        })?;
        let flow = flow.flow();

        sqlx::query(
            r#"
            INSERT INTO flows
                (id, workspace_id, channel_id, name, trigger_type, is_active, definition, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET workspace_id = EXCLUDED.workspace_id,
                channel_id = EXCLUDED.channel_id,
                name = EXCLUDED.name,
                trigger_type = EXCLUDED.trigger_type,
                is_active = EXCLUDED.is_active,
                definition = EXCLUDED.definition,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(flow.id.to_string())
        .bind(flow.workspace_id.to_string())
        .bind(&flow.channel_id)
        .bind(&flow.name)
        .bind(flow.trigger.trigger_type.as_str())
        .bind(flow.is_active)
        .bind(&definition)
        .bind(flow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(())
    }

    #[instrument(skip(self), fields(flow_id = %flow_id))]
    async fn set_active(&self, flow_id: FlowId, is_active: bool) -> Result<bool, FlowStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE flows
            SET is_active = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(flow_id.to_string())
        .bind(is_active)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        Ok(result.rows_affected() > 0)
    }
}
