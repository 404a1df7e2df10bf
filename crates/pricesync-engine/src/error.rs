//! Engine error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Unrecoverable configuration problem. Fatal at initialization.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Feed error: {0}")]
    Feed(#[from] pricesync_feed::FeedError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] pricesync_persistence::PersistenceError),

    #[error("REST error: {0}")]
    Rest(#[from] pricesync_rest::RestError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] pricesync_telemetry::TelemetryError),

    #[error("Command queue full")]
    Busy,

    /// The engine task has exited.
    #[error("Engine stopped")]
    Stopped,
}

pub type EngineResult<T> = Result<T, EngineError>;
