//! Error types for the engine crate.
//!
//! Errors split along who they belong to:
//! - `GraphError` and `GatewayError` end one conversation. The engine records
//!   them on the conversation state and never propagates them.
//! - `EngineError` is infrastructure failure (stores, scheduler). It is
//!   returned to the caller so the triggering delivery can be retried.

use replyflow_conversation::StoreError;
use replyflow_core::FlowId;
use replyflow_flow::NodeId;
use std::fmt;

/// Runtime structural failures. Fatal to the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// No predicate of a CONDITION node held.
    NoMatchingBranch { node_id: NodeId },
    /// The conversation ran more steps than the configured ceiling.
    StepLimitExceeded { limit: u32 },
    /// The cursor points at a node the flow no longer has.
    NodeNotFound { node_id: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMatchingBranch { node_id } => {
                write!(f, "no branch of condition {node_id} matched")
            }
            Self::StepLimitExceeded { limit } => write!(f, "step limit of {limit} exceeded"),
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors from the messaging gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Rate limits, timeouts, server errors. Retried under the same key.
    Transient { message: String },
    /// Blocked sender, invalid recipient, malformed request. Never retried.
    Permanent { message: String },
}

impl GatewayError {
    /// Returns true if the call may succeed when repeated.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient gateway error: {message}"),
            Self::Permanent { message } => write!(f, "permanent gateway error: {message}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Errors from scheduling or cancelling timers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulingError {
    /// The timer store failed.
    Backend { message: String },
}

impl fmt::Display for SchedulingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { message } => write!(f, "timer scheduling failed: {message}"),
        }
    }
}

impl std::error::Error for SchedulingError {}

/// Errors from flow storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowStoreError {
    /// A stored flow no longer passes validation.
    Invalid { flow_id: FlowId, reason: String },
    /// The backing store failed.
    Backend { message: String },
}

impl fmt::Display for FlowStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid { flow_id, reason } => {
                write!(f, "stored flow {flow_id} is invalid: {reason}")
            }
            Self::Backend { message } => write!(f, "flow store failed: {message}"),
        }
    }
}

impl std::error::Error for FlowStoreError {}

/// Errors from funnel counter storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    /// The backing store failed.
    Backend { message: String },
}

impl fmt::Display for StatsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { message } => write!(f, "stats store failed: {message}"),
        }
    }
}

impl std::error::Error for StatsError {}

/// Infrastructure failures surfaced to engine callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The flow does not exist.
    FlowNotFound { flow_id: FlowId },
    /// Conversation storage failed or a write lost a race.
    Store(StoreError),
    /// Flow storage failed.
    FlowStore(FlowStoreError),
    /// A timer could not be scheduled or cancelled.
    Scheduling(SchedulingError),
}

impl EngineError {
    /// Returns true if a concurrent writer advanced the conversation first.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_conflict())
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FlowNotFound { flow_id } => write!(f, "flow not found: {flow_id}"),
            Self::Store(e) => write!(f, "conversation store: {e}"),
            Self::FlowStore(e) => write!(f, "flow store: {e}"),
            Self::Scheduling(e) => write!(f, "scheduler: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<FlowStoreError> for EngineError {
    fn from(e: FlowStoreError) -> Self {
        Self::FlowStore(e)
    }
}

impl From<SchedulingError> for EngineError {
    fn from(e: SchedulingError) -> Self {
        Self::Scheduling(e)
    }
}
