//! HTTP routes: platform webhooks and the operator API.

use crate::error::ApiError;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use replyflow_core::FlowId;
use replyflow_engine::{EventRouter, FlowStore, IngestOutcome, Postback};
use replyflow_flow::{Flow, FunnelMetric, InboundEvent, PublishedFlow};
use serde::Serialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    router: Arc<EventRouter>,
}

impl AppState {
    /// Creates handler state over the event router.
    #[must_use]
    pub fn new(router: Arc<EventRouter>) -> Self {
        Self { router }
    }
}

/// Builds the application router.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/webhooks/events", post(receive_event))
        .route("/webhooks/postbacks", post(receive_postback))
        .route("/flows", post(publish_flow))
        .route("/flows/{id}/activate", post(activate_flow))
        .route("/flows/{id}/deactivate", post(deactivate_flow))
        .route("/flows/{id}/abort", post(abort_flow))
        .route("/flows/{id}/stats", get(flow_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_flow_id(id: &str) -> Result<FlowId, ApiError> {
    FlowId::from_str(id).map_err(|e| ApiError::InvalidId {
        id: id.to_string(),
        reason: e.to_string(),
    })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn receive_event(
    State(state): State<AppState>,
    Json(event): Json<InboundEvent>,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let outcome = state.router.handle_event(&event).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn receive_postback(
    State(state): State<AppState>,
    Json(postback): Json<Postback>,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let outcome = state.router.handle_postback(postback).await?;
    Ok((StatusCode::ACCEPTED, Json(outcome)))
}

async fn publish_flow(
    State(state): State<AppState>,
    Json(flow): Json<Flow>,
) -> Result<(StatusCode, Json<PublishedFlow>), ApiError> {
    let published = flow.publish()?;
    state
        .router
        .engine()
        .flows()
        .publish(published.clone())
        .await?;
    info!(flow_id = %published.id(), "flow published");
    Ok((StatusCode::CREATED, Json(published)))
}

/// Activation state after a toggle.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Activation {
    id: FlowId,
    is_active: bool,
}

async fn set_active(
    state: &AppState,
    id: &str,
    is_active: bool,
) -> Result<Json<Activation>, ApiError> {
    let flow_id = parse_flow_id(id)?;
    if !state
        .router
        .engine()
        .flows()
        .set_active(flow_id, is_active)
        .await?
    {
        return Err(ApiError::FlowNotFound { id: id.to_string() });
    }
    info!(%flow_id, is_active, "flow activation changed");
    Ok(Json(Activation {
        id: flow_id,
        is_active,
    }))
}

async fn activate_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Activation>, ApiError> {
    set_active(&state, &id, true).await
}

async fn deactivate_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Activation>, ApiError> {
    set_active(&state, &id, false).await
}

/// Result of a hard abort.
#[derive(Debug, Serialize)]
struct AbortReport {
    aborted: usize,
}

async fn abort_flow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<AbortReport>, ApiError> {
    let flow_id = parse_flow_id(&id)?;
    let aborted = state.router.engine().abort_flow(flow_id).await?;
    Ok(Json(AbortReport { aborted }))
}

async fn flow_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<BTreeMap<FunnelMetric, u64>>, ApiError> {
    let flow_id = parse_flow_id(&id)?;
    let engine = state.router.engine();
    if engine.flows().get(flow_id).await?.is_none() {
        return Err(ApiError::FlowNotFound { id });
    }
    Ok(Json(engine.stats().get_stats(flow_id).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use replyflow_conversation::InMemoryConversationStore;
    use replyflow_core::WorkspaceId;
    use replyflow_engine::{
        DeliveryDedup, DryRunGateway, EngineConfig, ExecutionEngine, InMemoryFlowStore,
        InMemoryStatsStore,
    };
    use replyflow_flow::{Button, Edge, MessageNode, Node, TriggerRule, TriggerType};
    use replyflow_scheduler::{DurableScheduler, InMemoryTimerStore};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        gateway: Arc<DryRunGateway>,
    }

    fn test_app() -> TestApp {
        let gateway = Arc::new(DryRunGateway::new());
        let engine = Arc::new(ExecutionEngine::new(
            Arc::new(InMemoryFlowStore::new()),
            Arc::new(InMemoryConversationStore::new()),
            gateway.clone(),
            Arc::new(InMemoryStatsStore::new()),
            Arc::new(DurableScheduler::new(Arc::new(InMemoryTimerStore::new()))),
            EngineConfig::default(),
        ));
        let router = Arc::new(EventRouter::new(engine, DeliveryDedup::default()));
        TestApp {
            app: app(AppState::new(router)),
            gateway,
        }
    }

    fn bootcamp_flow() -> Flow {
        Flow::new(
            WorkspaceId::new(),
            "chan",
            "bootcamp",
            TriggerRule::specific(TriggerType::Comment, ["bootcamp"]),
        )
        .with_node(Node::trigger("t"))
        .with_node(Node::message(
            "ask",
            MessageNode::text("Want the link?")
                .with_button(Button::new("Get link").with_metric(FunnelMetric::LinkClicked))
                .with_metric(FunnelMetric::OpeningMsgSent),
        ))
        .with_node(Node::message(
            "link",
            MessageNode::text("Here: example.com/link").with_metric(FunnelMetric::LinkMsgSent),
        ))
        .with_edge(Edge::new("e1", "t", "ask"))
        .with_edge(Edge::branch("e2", "ask", 0, "link"))
    }

    fn comment(user: &str, delivery_id: &str) -> Value {
        json!({
            "eventType": "COMMENT",
            "channelId": "chan",
            "externalUserId": user,
            "text": "bootcamp please",
            "commentId": format!("c-{delivery_id}"),
            "deliveryId": delivery_id,
        })
    }

    impl TestApp {
        async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
            let request = Request::builder().method(method).uri(uri);
            let request = match body {
                Some(body) => request
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string())),
                None => request.body(Body::empty()),
            }
            .expect("request");

            let response = self.app.clone().oneshot(request).await.expect("response");
            let status = response.status();
            let bytes = to_bytes(response.into_body(), usize::MAX)
                .await
                .expect("body");
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap_or(Value::Null)
            };
            (status, value)
        }

        async fn publish(&self, flow: Flow) -> String {
            let (status, body) = self
                .send("POST", "/flows", Some(serde_json::to_value(&flow).expect("encode")))
                .await;
            assert_eq!(status, StatusCode::CREATED, "{body}");
            flow.id.to_string()
        }
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let app = test_app();
        let (status, _) = app.send("GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_flow_is_rejected() {
        let app = test_app();
        let mut flow = bootcamp_flow();
        flow.edges.clear();
        let (status, body) = app
            .send("POST", "/flows", Some(serde_json::to_value(&flow).expect("encode")))
            .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().is_some_and(|e| e.contains("invalid flow")));
    }

    #[tokio::test]
    async fn comment_starts_flow_and_redelivery_is_dropped() {
        let app = test_app();
        let id = app.publish(bootcamp_flow()).await;

        let (status, body) = app
            .send("POST", "/webhooks/events", Some(comment("user-1", "d-1")))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], "started");
        assert_eq!(body["detail"]["status"], "WAITING");
        assert_eq!(app.gateway.direct_messages().len(), 1);

        let (status, body) = app
            .send("POST", "/webhooks/events", Some(comment("user-1", "d-1")))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], "duplicate");
        assert_eq!(app.gateway.direct_messages().len(), 1);

        let (status, stats) = app.send("GET", &format!("/flows/{id}/stats"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["totalTriggered"], 1);
        assert_eq!(stats["openingMsgSent"], 1);
        assert_eq!(stats["linkClicked"], 0);
        assert_eq!(stats.as_object().map(|m| m.len()), Some(FunnelMetric::ALL.len()));
    }

    #[tokio::test]
    async fn postback_resumes_conversation() {
        let app = test_app();
        let flow = bootcamp_flow();
        let flow_id = flow.id;
        let id = app.publish(flow).await;
        app.send("POST", "/webhooks/events", Some(comment("user-1", "d-1")))
            .await;

        let postback = json!({
            "flowId": flow_id,
            "externalUserId": "user-1",
            "input": {"type": "button_tap", "handle": 0},
            "deliveryId": "pb-1",
        });
        let (status, body) = app
            .send("POST", "/webhooks/postbacks", Some(postback))
            .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["outcome"], "resumed");
        assert_eq!(body["detail"]["status"], "COMPLETED");

        let (_, stats) = app.send("GET", &format!("/flows/{id}/stats"), None).await;
        assert_eq!(stats["linkClicked"], 1);
        assert_eq!(stats["linkMsgSent"], 1);
    }

    #[tokio::test]
    async fn deactivated_flow_stops_matching() {
        let app = test_app();
        let id = app.publish(bootcamp_flow()).await;

        let (status, body) = app
            .send("POST", &format!("/flows/{id}/deactivate"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["isActive"], false);

        let (_, body) = app
            .send("POST", "/webhooks/events", Some(comment("user-1", "d-1")))
            .await;
        assert_eq!(body["outcome"], "no_match");

        let (status, _) = app
            .send("POST", &format!("/flows/{id}/activate"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = app
            .send("POST", "/webhooks/events", Some(comment("user-1", "d-2")))
            .await;
        assert_eq!(body["outcome"], "started");
    }

    #[tokio::test]
    async fn abort_ends_active_conversations() {
        let app = test_app();
        let id = app.publish(bootcamp_flow()).await;
        app.send("POST", "/webhooks/events", Some(comment("user-1", "d-1")))
            .await;
        app.send("POST", "/webhooks/events", Some(comment("user-2", "d-2")))
            .await;

        let (status, body) = app.send("POST", &format!("/flows/{id}/abort"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["aborted"], 2);
    }

    #[tokio::test]
    async fn unknown_and_malformed_ids() {
        let app = test_app();
        let missing = FlowId::new();

        let (status, _) = app
            .send("POST", &format!("/flows/{missing}/activate"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.send("GET", &format!("/flows/{missing}/stats"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.send("POST", &format!("/flows/{missing}/abort"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.send("GET", "/flows/not-an-id/stats", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
