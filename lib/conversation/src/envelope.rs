//! Versioned envelope for persisted records.
//!
//! Everything written to a key-value bucket is wrapped so the schema can
//! evolve without a flag day: readers check `schema` before trusting the
//! payload shape.

use serde::{Deserialize, Serialize};

/// The current envelope schema.
pub const CURRENT_SCHEMA: u32 = 1;

/// A versioned wrapper around a persisted payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Schema of the payload.
    pub schema: u32,
    /// The wrapped payload.
    pub payload: T,
}

impl<T> Envelope<T> {
    /// Wraps a payload with the current schema.
    #[must_use]
    pub fn new(payload: T) -> Self {
        Self {
            schema: CURRENT_SCHEMA,
            payload,
        }
    }

    /// Unwraps the envelope, returning the payload.
    #[must_use]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T: Serialize> Envelope<T> {
    /// Serializes the envelope to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    /// Deserializes an envelope from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid envelope of `T`.
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
