//! Update ingestion.
//!
//! Parses raw stream frames and poll bodies into `NormalizedUpdate`s in
//! arrival order. Malformed input is dropped and counted here; callers never
//! see an error.

use crate::error::{FeedError, FeedResult};
use pricesync_core::{validate_price_input, NormalizedUpdate};
use pricesync_ws::{InboundMessage, RawUpdate};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, trace, warn};

/// Counters for everything ingestion has seen.
#[derive(Debug, Default)]
pub struct IngestionStats {
    /// Frames received (any shape, including malformed).
    pub frames: AtomicU64,
    /// Updates emitted.
    pub updates: AtomicU64,
    /// Frames or batch members dropped as malformed.
    pub malformed: AtomicU64,
    /// `error` frames reported by the service.
    pub service_errors: AtomicU64,
    pub heartbeats: AtomicU64,
}

impl IngestionStats {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn service_errors(&self) -> u64 {
        self.service_errors.load(Ordering::Relaxed)
    }

    pub fn heartbeats(&self) -> u64 {
        self.heartbeats.load(Ordering::Relaxed)
    }
}

/// Result of ingesting one frame.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Ingested {
    /// Valid updates in arrival order.
    pub updates: Vec<NormalizedUpdate>,
    /// Whole frames or batch members that were dropped.
    pub dropped: usize,
    /// The frame was a service-side `error` report.
    pub service_error: bool,
}

/// Frame parser and normalizer.
#[derive(Debug, Default)]
pub struct UpdateIngestion {
    stats: IngestionStats,
}

impl UpdateIngestion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &IngestionStats {
        &self.stats
    }

    /// Normalized updates contained in `raw`, in arrival order.
    pub fn handle(&self, raw: &str) -> Vec<NormalizedUpdate> {
        self.ingest(raw).updates
    }

    /// Like [`handle`](Self::handle) but also reports what was dropped.
    pub fn ingest(&self, raw: &str) -> Ingested {
        self.stats.frames.fetch_add(1, Ordering::Relaxed);
        let mut out = Ingested::default();

        let message = match parse_frame(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, frame = %truncate(raw, 200), "Dropping malformed frame");
                self.stats.malformed.fetch_add(1, Ordering::Relaxed);
                out.dropped = 1;
                return out;
            }
        };
        trace!(kind = message.kind(), "Inbound frame");

        match message {
            InboundMessage::Update(update) => match normalize(update) {
                Ok(update) => out.updates.push(update),
                Err(e) => {
                    warn!(error = %e, "Dropping invalid update");
                    out.dropped += 1;
                }
            },
            InboundMessage::Batch { updates } => {
                let total = updates.len();
                for (index, member) in updates.into_iter().enumerate() {
                    match serde_json::from_value::<RawUpdate>(member)
                        .map_err(|e| FeedError::Protocol(e.to_string()))
                        .and_then(normalize)
                    {
                        Ok(update) => out.updates.push(update),
                        Err(e) => {
                            warn!(index, total, error = %e, "Dropping malformed batch member");
                            out.dropped += 1;
                        }
                    }
                }
                debug!(total, accepted = out.updates.len(), "Batch ingested");
            }
            InboundMessage::Heartbeat => {
                self.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
            }
            InboundMessage::Error { detail } => {
                warn!(%detail, "Pricing service reported an error");
                self.stats.service_errors.fetch_add(1, Ordering::Relaxed);
                out.service_error = true;
            }
        }

        self.stats
            .malformed
            .fetch_add(out.dropped as u64, Ordering::Relaxed);
        self.stats
            .updates
            .fetch_add(out.updates.len() as u64, Ordering::Relaxed);
        out
    }
}

fn parse_frame(raw: &str) -> FeedResult<InboundMessage> {
    serde_json::from_str(raw).map_err(|e| FeedError::Protocol(e.to_string()))
}

fn normalize(raw: RawUpdate) -> FeedResult<NormalizedUpdate> {
    validate_price_input(&raw.id, raw.price).map_err(|e| FeedError::Protocol(e.to_string()))?;
    Ok(NormalizedUpdate {
        id: raw.id,
        price: raw.price,
        timestamp: raw.timestamp,
        version: raw.version,
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricesync_core::Price;
    use rust_decimal_macros::dec;

    #[test]
    fn test_single_update() {
        let ingestion = UpdateIngestion::new();
        let updates = ingestion
            .handle(r#"{"type":"update","id":"sku-42","price":21.50,"timestamp":90,"version":7}"#);

        assert_eq!(
            updates,
            vec![NormalizedUpdate {
                id: "sku-42".to_string(),
                price: Price::new(dec!(21.50)),
                timestamp: 90,
                version: 7,
            }]
        );
        assert_eq!(ingestion.stats().updates(), 1);
    }

    #[test]
    fn test_batch_preserves_order_and_drops_bad_members() {
        let ingestion = UpdateIngestion::new();
        let raw = r#"{"type":"batch","updates":[
            {"id":"a","price":"1.00","timestamp":1,"version":1},
            {"id":"b","price":"oops","timestamp":2,"version":1},
            {"id":"","price":"3","timestamp":3,"version":1},
            {"id":"c","price":-4,"timestamp":4,"version":1},
            {"type":"update","id":"d","price":5,"timestamp":5,"version":2}
        ]}"#;

        let result = ingestion.ingest(raw);
        let ids: Vec<_> = result.updates.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "d"]);
        assert_eq!(result.dropped, 3);
        assert_eq!(ingestion.stats().malformed(), 3);
    }

    #[test]
    fn test_malformed_frames_are_counted_not_returned() {
        let ingestion = UpdateIngestion::new();
        assert!(ingestion.handle("not json").is_empty());
        assert!(ingestion.handle(r#"{"type":"mystery"}"#).is_empty());
        assert!(ingestion
            .handle(r#"{"type":"update","id":"a","timestamp":1,"version":1}"#)
            .is_empty());
        assert_eq!(ingestion.stats().malformed(), 3);
        assert_eq!(ingestion.stats().frames(), 3);
    }

    #[test]
    fn test_heartbeat_and_error_frames() {
        let ingestion = UpdateIngestion::new();
        assert!(ingestion.handle(r#"{"type":"heartbeat"}"#).is_empty());

        let result = ingestion.ingest(r#"{"type":"error","detail":"rate limited"}"#);
        assert!(result.updates.is_empty());
        assert!(result.service_error);
        assert_eq!(result.dropped, 0);

        assert_eq!(ingestion.stats().heartbeats(), 1);
        assert_eq!(ingestion.stats().service_errors(), 1);
        assert_eq!(ingestion.stats().malformed(), 0);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ab", 10), "ab");
    }
}
