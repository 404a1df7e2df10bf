//! Synchronization data model.
//!
//! A `PriceEntity` is the confirmed state for one id; a `PendingEdit` is an
//! unconfirmed local proposal; a `NormalizedUpdate` is one remote price
//! change after ingestion has flattened the wire shapes.

use crate::error::{CoreError, Result};
use crate::Price;
use serde::{Deserialize, Serialize};

/// Stable identifier of a priced item (e.g. `"sku-42"`).
pub type EntityId = String;

/// Reject ids and prices that can never be valid entity state.
pub fn validate_price_input(id: &str, price: Price) -> Result<()> {
    if id.trim().is_empty() {
        return Err(CoreError::InvalidEntityId("empty id".to_string()));
    }
    if price.is_negative() {
        return Err(CoreError::InvalidPrice(format!("{id}: negative price {price}")));
    }
    Ok(())
}

/// Where the confirmed value of an entity came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Adopted from the pricing service.
    Server,
    /// A local edit won a conflict (or is shown optimistically).
    Local,
    /// A collaborator supplied a merged value for an interactive conflict.
    Merged,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Local => write!(f, "local"),
            Self::Merged => write!(f, "merged"),
        }
    }
}

/// Confirmed price state for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceEntity {
    pub id: EntityId,
    pub price: Price,
    /// Server version; non-decreasing across confirmed states.
    pub version: u64,
    pub origin: Origin,
    /// Unix ms of the last confirmed change.
    pub last_updated: i64,
}

/// Unconfirmed local price proposal.
///
/// Never mutated: a newer proposal for the same id replaces it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEdit {
    pub id: EntityId,
    pub proposed_price: Price,
    /// Unix ms when the local actor proposed the price.
    pub submitted_at: i64,
    pub client_seq: u64,
}

impl PendingEdit {
    /// Age of the edit at `now_ms`.
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.submitted_at)
    }
}

/// Remote price change in the uniform shape produced by ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedUpdate {
    pub id: EntityId,
    pub price: Price,
    /// Server-side unix ms of the change.
    pub timestamp: i64,
    pub version: u64,
}

/// Externally visible price for an id.
///
/// Carries the optimistic local value while an edit is pending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceView {
    pub id: EntityId,
    pub price: Price,
    pub version: u64,
    pub origin: Origin,
    pub last_updated: i64,
    pub pending: bool,
}

impl From<&PriceEntity> for PriceView {
    fn from(entity: &PriceEntity) -> Self {
        Self {
            id: entity.id.clone(),
            price: entity.price,
            version: entity.version,
            origin: entity.origin,
            last_updated: entity.last_updated,
            pending: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_origin_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Origin::Merged).unwrap(), "\"merged\"");
        let origin: Origin = serde_json::from_str("\"server\"").unwrap();
        assert_eq!(origin, Origin::Server);
    }

    #[test]
    fn test_pending_edit_wire_shape() {
        let edit = PendingEdit {
            id: "sku-42".to_string(),
            proposed_price: Price::new(dec!(19.99)),
            submitted_at: 100,
            client_seq: 3,
        };
        let json = serde_json::to_value(&edit).unwrap();
        assert_eq!(json["proposedPrice"], "19.99");
        assert_eq!(json["submittedAt"], 100);
        assert_eq!(json["clientSeq"], 3);
    }

    #[test]
    fn test_validate_price_input() {
        assert!(validate_price_input("sku-1", Price::new(dec!(1.5))).is_ok());
        assert!(validate_price_input("sku-1", Price::ZERO).is_ok());
        assert!(matches!(
            validate_price_input(" ", Price::ZERO),
            Err(CoreError::InvalidEntityId(_))
        ));
        assert!(matches!(
            validate_price_input("sku-1", Price::new(dec!(-0.01))),
            Err(CoreError::InvalidPrice(_))
        ));
    }

    #[test]
    fn test_pending_edit_age() {
        let edit = PendingEdit {
            id: "a".to_string(),
            proposed_price: Price::ZERO,
            submitted_at: 1_000,
            client_seq: 1,
        };
        assert_eq!(edit.age_ms(4_000), 3_000);
        assert_eq!(edit.age_ms(500), -500);
    }
}
