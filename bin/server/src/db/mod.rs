//! Database repositories for replyflow.
//!
//! This module provides Postgres-backed implementations of:
//! - `FlowStore` for published flows
//! - `StatsStore` for funnel counters

pub mod flow;
pub mod stats;

pub use flow::PgFlowStore;
pub use stats::PgStatsStore;
