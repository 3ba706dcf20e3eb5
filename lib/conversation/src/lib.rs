//! Conversation state for replyflow.
//!
//! This crate provides:
//!
//! - **State**: the durable per-(flow, user) cursor, status, variables and step log
//! - **Stores**: the compare-and-swap `ConversationStateStore` port with
//!   in-memory and NATS JetStream KV implementations

pub mod envelope;
pub mod error;
pub mod nats;
pub mod state;
pub mod store;

pub use error::StoreError;
pub use nats::NatsConversationStore;
pub use state::{
    ConversationKey, ConversationState, ConversationStatus, DispatchKey, StepEntry, StepOutcome,
    TriggerContext, WaitingOn,
};
pub use store::{ConversationFilter, ConversationStateStore, InMemoryConversationStore};
