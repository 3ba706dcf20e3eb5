//! Typed identifiers for workspaces, flows and timers.
//!
//! IDs wrap a ULID, so they sort by creation time. Trigger tie-breaking
//! relies on that ordering.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

/// Defines a ULID newtype that displays as `{prefix}_{ulid}`.
///
/// Parsing accepts the prefixed form or a bare ULID. Serde uses the bare
/// ULID, which is what the stores and the wire format carry.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Display prefix, without the separator.
            pub const PREFIX: &'static str = $prefix;

            /// Generates a fresh ID.
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Wraps an existing ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// The wrapped ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let raw = match s.split_once('_') {
                    Some((prefix, rest)) if prefix == Self::PREFIX => rest,
                    Some((prefix, _)) => {
                        return Err(ParseIdError {
                            id_type: stringify!($name),
                            reason: format!("expected prefix '{}', found '{prefix}'", Self::PREFIX),
                        });
                    }
                    None => s,
                };
                raw.parse::<Ulid>().map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }

        impl From<Ulid> for $name {
            fn from(ulid: Ulid) -> Self {
                Self(ulid)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a workspace (the tenant that owns channels and flows).
    WorkspaceId,
    "ws"
);

define_id!(
    /// Unique identifier for a published flow.
    FlowId,
    "flow"
);

define_id!(
    /// Unique identifier for a durable scheduler timer.
    TimerId,
    "tmr"
);
