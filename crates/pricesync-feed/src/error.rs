//! Feed error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    /// Malformed inbound message. Dropped, never affects connection state.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Unknown conflict strategy: {0}")]
    UnknownStrategy(String),

    /// Ticket does not match an outstanding interactive conflict.
    #[error("No outstanding conflict for {id} (ticket {seq})")]
    UnknownConflict { id: String, seq: u64 },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<pricesync_core::CoreError> for FeedError {
    fn from(e: pricesync_core::CoreError) -> Self {
        Self::InvalidData(e.to_string())
    }
}

pub type FeedResult<T> = Result<T, FeedError>;
