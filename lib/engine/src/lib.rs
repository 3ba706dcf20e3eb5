//! Flow execution engine for replyflow.
//!
//! This crate turns published flows into running conversations:
//!
//! - **Engine**: the per-conversation state machine (`start`, `resume`,
//!   `recover`, abandonment and operator aborts)
//! - **Dispatcher**: idempotent outbound calls with bounded retries
//! - **Stats**: once-per-conversation funnel counters
//! - **Ingest**: delivery dedup, DM reply routing and trigger matching
//! - **Ports**: `FlowStore`, `MessagingGateway`, `StatsStore`, `TimerScheduler`

pub mod dedup;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod lease;
pub mod stats;
pub mod store;
pub mod timer;

pub use dedup::DeliveryDedup;
pub use dispatcher::{ActionDispatcher, Effect, RetryPolicy};
pub use engine::{
    EngineConfig, ExecutionEngine, IgnoreReason, ResumeInput, ResumeOutcome, StartOutcome,
};
pub use error::{
    EngineError, FlowStoreError, GatewayError, GraphError, SchedulingError, StatsError,
};
pub use gateway::{CommentReply, DirectMessage, DryRunGateway, MessagingGateway, OutboundButton};
pub use ingest::{EventRouter, IngestOutcome, Postback};
pub use lease::{ConversationLease, ConversationLocks};
pub use stats::{InMemoryStatsStore, StatsRecorder, StatsStore};
pub use store::{FlowStore, InMemoryFlowStore};
pub use timer::TimerScheduler;
