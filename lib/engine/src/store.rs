//! Flow storage port.

use crate::error::FlowStoreError;
use async_trait::async_trait;
use replyflow_core::FlowId;
use replyflow_flow::{PublishedFlow, TriggerType};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Published flows, as read by ingestion and the engine.
#[async_trait]
pub trait FlowStore: Send + Sync {
    /// Active flows on `channel_id` whose trigger type is `event_type`.
    async fn list_active_flows(
        &self,
        channel_id: &str,
        event_type: TriggerType,
    ) -> Result<Vec<Arc<PublishedFlow>>, FlowStoreError>;

    /// Loads a flow whether or not it is active, so in-flight
    /// conversations can drain after deactivation.
    async fn get(&self, flow_id: FlowId) -> Result<Option<Arc<PublishedFlow>>, FlowStoreError>;

    /// Inserts or replaces a flow.
    async fn publish(&self, flow: PublishedFlow) -> Result<(), FlowStoreError>;

    /// Activates or deactivates a flow. Returns false if it does not exist.
    async fn set_active(&self, flow_id: FlowId, is_active: bool) -> Result<bool, FlowStoreError>;
}

/// Process-local flow store.
#[derive(Debug, Default)]
pub struct InMemoryFlowStore {
    flows: RwLock<HashMap<FlowId, Arc<PublishedFlow>>>,
}

impl InMemoryFlowStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FlowStore for InMemoryFlowStore {
    async fn list_active_flows(
        &self,
        channel_id: &str,
        event_type: TriggerType,
    ) -> Result<Vec<Arc<PublishedFlow>>, FlowStoreError> {
        let flows = self.flows.read().unwrap_or_else(PoisonError::into_inner);
        Ok(flows
            .values()
            .filter(|flow| {
                let flow = flow.flow();
                flow.is_active
                    && flow.channel_id == channel_id
                    && flow.trigger.trigger_type == event_type
            })
            .cloned()
            .collect())
    }

    async fn get(&self, flow_id: FlowId) -> Result<Option<Arc<PublishedFlow>>, FlowStoreError> {
        Ok(self
            .flows
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&flow_id)
            .cloned())
    }

    async fn publish(&self, flow: PublishedFlow) -> Result<(), FlowStoreError> {
        self.flows
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(flow.id(), Arc::new(flow));
        Ok(())
    }

    async fn set_active(&self, flow_id: FlowId, is_active: bool) -> Result<bool, FlowStoreError> {
        let mut flows = self.flows.write().unwrap_or_else(PoisonError::into_inner);
        let Some(current) = flows.get_mut(&flow_id) else {
            return Ok(false);
        };
        let mut updated = PublishedFlow::clone(current);
        updated.set_active(is_active);
        *current = Arc::new(updated);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replyflow_core::WorkspaceId;
    use replyflow_flow::{Edge, Flow, MessageNode, Node, TriggerRule};

    fn flow(channel: &str, trigger_type: TriggerType) -> PublishedFlow {
        Flow::new(
            WorkspaceId::new(),
            channel,
            "welcome",
            TriggerRule::any(trigger_type),
        )
        .with_node(Node::trigger("t"))
        .with_node(Node::message("m1", MessageNode::text("hi")))
        .with_edge(Edge::new("e1", "t", "m1"))
        .publish()
        .expect("valid flow")
    }

    #[tokio::test]
    async fn list_filters_channel_type_and_activation() {
        let store = InMemoryFlowStore::new();
        let comment = flow("chan", TriggerType::Comment);
        let comment_id = comment.id();
        store.publish(comment).await.expect("publish");
        store
            .publish(flow("chan", TriggerType::Dm))
            .await
            .expect("publish");
        store
            .publish(flow("other", TriggerType::Comment))
            .await
            .expect("publish");

        let active = store
            .list_active_flows("chan", TriggerType::Comment)
            .await
            .expect("list");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), comment_id);

        assert!(store.set_active(comment_id, false).await.expect("set"));
        assert!(
            store
                .list_active_flows("chan", TriggerType::Comment)
                .await
                .expect("list")
                .is_empty()
        );

        let drained = store.get(comment_id).await.expect("get").expect("exists");
        assert!(!drained.is_active());
    }

    #[tokio::test]
    async fn set_active_on_missing_flow() {
        let store = InMemoryFlowStore::new();
        assert!(!store.set_active(FlowId::new(), true).await.expect("set"));
    }
}
