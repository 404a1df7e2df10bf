//! Snapshot persistence for the pricing synchronization engine.
//!
//! The engine saves its whole state as one `PersistedState` record through
//! the narrow [`PersistenceStore`] trait. Two backends:
//! - `JsonFileStore`: JSON file replaced atomically (write temp + rename)
//! - `MemoryStore`: process-local, for tests and memory-only mode

pub mod error;
pub mod store;

pub use error::{PersistenceError, PersistenceResult};
pub use store::{JsonFileStore, MemoryStore, PersistenceStore};
