//! Error types for the conversation crate.
//!
//! `StoreError` covers every conversation store failure. `Conflict` is the
//! expected outcome of a lost compare-and-swap race; callers reload and retry
//! or give up, it never indicates corruption.

use crate::state::ConversationKey;
use std::fmt;

/// Errors from conversation state storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The stored version differs from the version the caller read.
    Conflict {
        key: ConversationKey,
        expected: u64,
        actual: Option<u64>,
    },
    /// A stored record could not be encoded or decoded.
    Serialization { message: String },
    /// The backing store failed.
    Backend { message: String },
}

impl StoreError {
    /// Returns true if this is a compare-and-swap conflict.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict {
                key,
                expected,
                actual,
            } => match actual {
                Some(actual) => write!(
                    f,
                    "version conflict for {key}: expected {expected}, found {actual}"
                ),
                None => write!(
                    f,
                    "version conflict for {key}: expected {expected}, found none"
                ),
            },
            Self::Serialization { message } => {
                write!(f, "conversation serialization failed: {message}")
            }
            Self::Backend { message } => write!(f, "conversation store failed: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}
