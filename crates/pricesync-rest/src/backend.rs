//! Pricing service backend trait.
//!
//! Provides a trait-based abstraction over the request/response side of the
//! pricing service. This allows for:
//! - Dependency injection for testing
//! - Polling and sync push sharing one transport

use crate::error::RestResult;
use pricesync_core::{EntityId, PendingEdit};
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// One acknowledged edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAckEntry {
    pub id: EntityId,
    pub client_seq: u64,
}

/// One edit the service refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRejection {
    pub id: EntityId,
    pub client_seq: u64,
    #[serde(default)]
    pub reason: String,
}

/// Service response to a sync push.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAck {
    #[serde(default)]
    pub accepted: Vec<SyncAckEntry>,
    #[serde(default)]
    pub rejected: Vec<SyncRejection>,
}

impl SyncAck {
    /// Accept every edit in `edits`.
    pub fn accept_all(edits: &[PendingEdit]) -> Self {
        Self {
            accepted: edits
                .iter()
                .map(|e| SyncAckEntry {
                    id: e.id.clone(),
                    client_seq: e.client_seq,
                })
                .collect(),
            rejected: Vec::new(),
        }
    }
}

/// Request/response access to the pricing service.
pub trait PricingBackend: Send + Sync {
    /// Fetch current prices for `ids`.
    ///
    /// Returns the raw response body, which has the same shape as an inbound
    /// stream message (normally a `batch`), so it can go through ingestion.
    fn poll<'a>(&'a self, ids: &'a [EntityId]) -> BoxFuture<'a, RestResult<String>>;

    /// Push pending edits directly, outside the stream.
    fn push_edits<'a>(&'a self, edits: &'a [PendingEdit]) -> BoxFuture<'a, RestResult<SyncAck>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricesync_core::Price;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sync_ack_parses_partial_response() {
        let ack: SyncAck = serde_json::from_str(
            r#"{"rejected":[{"id":"sku-1","clientSeq":4,"reason":"locked"}]}"#,
        )
        .unwrap();
        assert!(ack.accepted.is_empty());
        assert_eq!(ack.rejected[0].client_seq, 4);
        assert_eq!(ack.rejected[0].reason, "locked");
    }

    #[test]
    fn test_accept_all() {
        let edits = vec![PendingEdit {
            id: "sku-1".to_string(),
            proposed_price: Price::new(dec!(5)),
            submitted_at: 0,
            client_seq: 9,
        }];
        let ack = SyncAck::accept_all(&edits);
        assert_eq!(
            ack.accepted,
            vec![SyncAckEntry {
                id: "sku-1".to_string(),
                client_seq: 9
            }]
        );
    }
}
