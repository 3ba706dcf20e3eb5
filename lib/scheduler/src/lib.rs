//! Durable timers and background sweeps for replyflow.
//!
//! This crate provides:
//!
//! - **Timers**: persisted DELAY timers, in memory or in NATS KV
//! - **Durable scheduler**: the engine's timer port over a timer store
//! - **Runner**: fires due timers, abandons idle conversations, and
//!   re-drives stalled ones

pub mod durable;
pub mod error;
pub mod nats;
pub mod runner;
pub mod timer;

pub use durable::DurableScheduler;
pub use error::{SchedulerError, TimerError};
pub use nats::{NatsTimerStore, TIMERS_BUCKET};
pub use runner::{RunnerConfig, SchedulerRunner, SweepReport};
pub use timer::{InMemoryTimerStore, Timer, TimerStore};
