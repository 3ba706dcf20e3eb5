//! Core types shared by every replyflow crate.
//!
//! This crate provides the strongly-typed identifiers for flows, workspaces
//! and timers, plus the `Result` alias used at wiring boundaries.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{FlowId, ParseIdError, TimerId, WorkspaceId};
