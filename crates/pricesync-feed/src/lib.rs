//! Price feed processing.
//!
//! Turns raw inbound frames into confirmed per-entity price state:
//! - `UpdateIngestion`: wire frames to `NormalizedUpdate`s
//! - `PriceState`: confirmed entities, pending edits, conflict handling
//! - `ConflictResolver`: pluggable local-vs-remote strategies
//! - `ObserverRegistry`: per-id fan-out to collaborators

pub mod conflict;
pub mod error;
pub mod ingestion;
pub mod observers;
pub mod price_state;

pub use conflict::{
    ConflictDecision, ConflictNotice, ConflictOutcome, ConflictRecord, ConflictResolver,
    ConflictStrategy, ConflictTicket, Interactive, LatestWins, LocalPriority, Resolution,
};
pub use error::{FeedError, FeedResult};
pub use ingestion::{Ingested, IngestionStats, UpdateIngestion};
pub use observers::{ConflictCallback, ObserverRegistry, PriceCallback, WatchId};
pub use price_state::{
    PriceState, StateEffect, DEFAULT_CONFLICT_HISTORY, DEFAULT_CONFLICT_QUEUE_LIMIT,
};
