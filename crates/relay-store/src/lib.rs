//! Agent directory and conversation store.
//!
//! These are the persistence collaborators a voice session consumes: a
//! read-only agent lookup, and an append-only per-session conversation log
//! with the caller's registration state. Every function takes a borrowed
//! `rusqlite::Connection` and is synchronous; callers on the async side run
//! them under `spawn_blocking`.

mod agents;
mod conversations;

pub use agents::{get_agent, upsert_agent};
pub use conversations::{
    append_message, create_conversation, end_conversation, get_registration, recent_messages,
    update_registration, CreateConversationParams,
};

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),
}
