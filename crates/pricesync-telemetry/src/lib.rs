//! Prometheus metrics, sync statistics and structured logging.
//!
//! - Prometheus metrics for connection state, ingestion, conflicts, sync
//! - `SyncMetrics`: in-process running totals read through `MetricsSnapshot`
//! - Structured logging with tracing (JSON in production)

pub mod collector;
pub mod error;
pub mod logging;
pub mod metrics;

pub use collector::{MetricsSnapshot, SyncMetrics};
pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
