//! Domain error types for server operations.
//!
//! `ApiError` is what request handlers return; it maps onto an HTTP status
//! and a user-safe JSON body. `StartupError` covers bootstrap and is wrapped
//! in a rootcause `Report` by `main`.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use replyflow_engine::{EngineError, FlowStoreError, StatsError};
use replyflow_flow::ValidationError;
use std::fmt;
use tracing::error;

/// Errors returned by HTTP handlers.
#[derive(Debug)]
pub enum ApiError {
    /// A path parameter is not a valid ID.
    InvalidId { id: String, reason: String },
    /// The flow does not exist.
    FlowNotFound { id: String },
    /// A published flow failed validation.
    InvalidFlow(ValidationError),
    /// A concurrent writer advanced the conversation first.
    Conflict { details: String },
    /// The engine failed on infrastructure.
    Engine(EngineError),
    /// Flow storage failed.
    FlowStore(FlowStoreError),
    /// Stats storage failed.
    Stats(StatsError),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId { id, reason } => write!(f, "invalid id '{id}': {reason}"),
            Self::FlowNotFound { id } => write!(f, "flow '{id}' not found"),
            Self::InvalidFlow(e) => write!(f, "invalid flow: {e}"),
            Self::Conflict { details } => write!(f, "conflict: {details}"),
            Self::Engine(e) => write!(f, "engine error: {e}"),
            Self::FlowStore(e) => write!(f, "flow store error: {e}"),
            Self::Stats(e) => write!(f, "stats error: {e}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    /// The HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidId { .. } => StatusCode::BAD_REQUEST,
            Self::FlowNotFound { .. } => StatusCode::NOT_FOUND,
            Self::InvalidFlow(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Engine(EngineError::FlowNotFound { .. }) => StatusCode::NOT_FOUND,
            Self::Engine(_) | Self::FlowStore(_) | Self::Stats(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// A message safe to show to callers.
    fn public_message(&self) -> String {
        match self {
            Self::InvalidId { .. }
            | Self::FlowNotFound { .. }
            | Self::InvalidFlow(_)
            | Self::Conflict { .. } => self.to_string(),
            Self::Engine(EngineError::FlowNotFound { flow_id }) => {
                format!("flow '{flow_id}' not found")
            }
            Self::Engine(_) | Self::FlowStore(_) | Self::Stats(_) => {
                "temporarily unavailable".to_string()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let body = serde_json::json!({ "error": self.public_message() });
        (status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        if e.is_conflict() {
            return Self::Conflict {
                details: e.to_string(),
            };
        }
        Self::Engine(e)
    }
}

impl From<FlowStoreError> for ApiError {
    fn from(e: FlowStoreError) -> Self {
        Self::FlowStore(e)
    }
}

impl From<StatsError> for ApiError {
    fn from(e: StatsError) -> Self {
        Self::Stats(e)
    }
}

impl From<ValidationError> for ApiError {
    fn from(e: ValidationError) -> Self {
        Self::InvalidFlow(e)
    }
}

/// Errors raised while bootstrapping the server.
#[derive(Debug)]
pub enum StartupError {
    /// Configuration is missing or invalid.
    Config { details: String },
    /// The database could not be reached or migrated.
    Database { details: String },
    /// NATS could not be reached or a bucket could not be opened.
    Nats { details: String },
    /// The messaging gateway client could not be built.
    Gateway { details: String },
    /// The listener could not be bound or the server failed.
    Serve { details: String },
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "configuration error: {details}"),
            Self::Database { details } => write!(f, "database error: {details}"),
            Self::Nats { details } => write!(f, "NATS error: {details}"),
            Self::Gateway { details } => write!(f, "gateway error: {details}"),
            Self::Serve { details } => write!(f, "server error: {details}"),
        }
    }
}

impl std::error::Error for StartupError {}
