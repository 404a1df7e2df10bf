//! REST client for the pricing service.
//!
//! Used for the two paths that deliberately bypass the stream:
//! - Polling the current prices of the interest set in degraded mode
//! - Pushing aged pending edits directly so delivery does not depend on
//!   stream health

pub mod backend;
pub mod client;
pub mod error;
pub mod mock;

pub use backend::{BoxFuture, PricingBackend, SyncAck, SyncAckEntry, SyncRejection};
pub use client::HttpPricingClient;
pub use error::{RestError, RestResult};
pub use mock::MockPricingBackend;
