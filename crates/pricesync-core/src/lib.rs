//! Core domain types for the pricing synchronization engine.
//!
//! This crate provides the fundamental types shared by every other crate:
//! - `Price`: Precision-safe decimal price
//! - `PriceEntity`, `PendingEdit`, `NormalizedUpdate`: the synchronization data model
//! - `PersistedState`: the single persisted record layout
//! - `Clock`: injectable time source for deterministic tests

pub mod clock;
pub mod decimal;
pub mod error;
pub mod snapshot;
pub mod types;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use decimal::Price;
pub use error::{CoreError, Result};
pub use snapshot::{PersistedState, SNAPSHOT_FORMAT_VERSION};
pub use types::{
    validate_price_input, EntityId, NormalizedUpdate, Origin, PendingEdit, PriceEntity, PriceView,
};
