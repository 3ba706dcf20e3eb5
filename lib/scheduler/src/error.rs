//! Error types for the scheduler crate.
//!
//! - `TimerError`: errors from timer storage
//! - `SchedulerError`: errors from a runner pass, wrapping the engine's

use replyflow_core::TimerId;
use replyflow_engine::{EngineError, SchedulingError};
use std::fmt;

/// Errors from timer operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Timer not found.
    NotFound { id: TimerId },
    /// Storage operation failed.
    StorageFailed { reason: String },
    /// A stored timer could not be encoded or decoded.
    Serialization { reason: String },
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { id } => write!(f, "timer not found: {id}"),
            Self::StorageFailed { reason } => write!(f, "timer storage failed: {reason}"),
            Self::Serialization { reason } => {
                write!(f, "timer serialization failed: {reason}")
            }
        }
    }
}

impl std::error::Error for TimerError {}

impl From<serde_json::Error> for TimerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<TimerError> for SchedulingError {
    fn from(e: TimerError) -> Self {
        Self::Backend {
            message: e.to_string(),
        }
    }
}

/// Errors from a scheduler pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Loading or updating timers failed.
    Timer(TimerError),
    /// The engine failed on infrastructure.
    Engine(EngineError),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timer(e) => write!(f, "timer store: {e}"),
            Self::Engine(e) => write!(f, "engine: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<TimerError> for SchedulerError {
    fn from(e: TimerError) -> Self {
        Self::Timer(e)
    }
}

impl From<EngineError> for SchedulerError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}
