//! Conflict resolution between a pending local edit and a remote update.
//!
//! A conflict exists when an id has a `PendingEdit` and a newer remote
//! update arrives with a different price. The configured
//! [`ConflictResolver`] decides who wins; `Interactive` defers the decision
//! to a collaborator through a [`ConflictNotice`].

use crate::error::FeedError;
use pricesync_core::{EntityId, NormalizedUpdate, PendingEdit, Price, PriceEntity};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Configured resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    LatestWins,
    LocalPriority,
    Interactive,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LatestWins => "latest-wins",
            Self::LocalPriority => "local-priority",
            Self::Interactive => "interactive",
        }
    }

    /// Build the resolver for this strategy.
    pub fn resolver(self) -> Box<dyn ConflictResolver> {
        match self {
            Self::LatestWins => Box::new(LatestWins),
            Self::LocalPriority => Box::new(LocalPriority),
            Self::Interactive => Box::new(Interactive),
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStrategy {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "latest-wins" => Ok(Self::LatestWins),
            "local-priority" => Ok(Self::LocalPriority),
            "interactive" => Ok(Self::Interactive),
            other => Err(FeedError::UnknownStrategy(other.to_string())),
        }
    }
}

/// A resolver's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Drop the pending edit and confirm the remote value.
    AdoptRemote,
    /// Confirm the local value and re-assert it to the service.
    KeepLocal,
    /// Block the id until a collaborator decides.
    Defer,
}

/// Pluggable conflict strategy.
pub trait ConflictResolver: Send + Sync {
    fn strategy(&self) -> ConflictStrategy;

    fn resolve(&self, local: &PendingEdit, remote: &NormalizedUpdate) -> Resolution;
}

/// Later timestamp wins; ties go to the service.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestWins;

impl ConflictResolver for LatestWins {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::LatestWins
    }

    fn resolve(&self, local: &PendingEdit, remote: &NormalizedUpdate) -> Resolution {
        if local.submitted_at > remote.timestamp {
            Resolution::KeepLocal
        } else {
            Resolution::AdoptRemote
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPriority;

impl ConflictResolver for LocalPriority {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::LocalPriority
    }

    fn resolve(&self, _local: &PendingEdit, _remote: &NormalizedUpdate) -> Resolution {
        Resolution::KeepLocal
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Interactive;

impl ConflictResolver for Interactive {
    fn strategy(&self) -> ConflictStrategy {
        ConflictStrategy::Interactive
    }

    fn resolve(&self, _local: &PendingEdit, _remote: &NormalizedUpdate) -> Resolution {
        Resolution::Defer
    }
}

/// Collaborator's answer to an interactive conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "price")]
pub enum ConflictDecision {
    KeepLocal,
    UseRemote,
    /// Confirm a collaborator-supplied value and propose it to the service.
    Merged(Price),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "decision")]
pub enum ConflictOutcome {
    LocalWins,
    RemoteWins,
    AwaitingDecision,
    Resolved(ConflictDecision),
}

impl ConflictOutcome {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalWins => "local_wins",
            Self::RemoteWins => "remote_wins",
            Self::AwaitingDecision => "awaiting_decision",
            Self::Resolved(ConflictDecision::KeepLocal) => "resolved_keep_local",
            Self::Resolved(ConflictDecision::UseRemote) => "resolved_use_remote",
            Self::Resolved(ConflictDecision::Merged(_)) => "resolved_merged",
        }
    }
}

/// Handle identifying one outstanding interactive conflict.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictTicket {
    pub id: EntityId,
    pub seq: u64,
}

/// Diagnostic record kept in the bounded conflict history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: EntityId,
    pub local_edit: PendingEdit,
    pub remote_update: NormalizedUpdate,
    pub detected_at: i64,
    pub strategy: ConflictStrategy,
    pub outcome: ConflictOutcome,
}

/// Emitted to conflict listeners when a decision is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictNotice {
    pub ticket: ConflictTicket,
    pub local_edit: PendingEdit,
    pub remote_update: NormalizedUpdate,
    /// Confirmed state before the conflicting update, if any.
    pub current: Option<PriceEntity>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn edit(submitted_at: i64) -> PendingEdit {
        PendingEdit {
            id: "sku-42".to_string(),
            proposed_price: Price::new(dec!(19.99)),
            submitted_at,
            client_seq: 1,
        }
    }

    fn update(timestamp: i64) -> NormalizedUpdate {
        NormalizedUpdate {
            id: "sku-42".to_string(),
            price: Price::new(dec!(21.50)),
            timestamp,
            version: 7,
        }
    }

    #[test]
    fn test_strategy_names_round_trip() {
        for strategy in [
            ConflictStrategy::LatestWins,
            ConflictStrategy::LocalPriority,
            ConflictStrategy::Interactive,
        ] {
            assert_eq!(strategy.as_str().parse::<ConflictStrategy>().unwrap(), strategy);
            assert_eq!(strategy.resolver().strategy(), strategy);
        }
        assert!(matches!(
            "newest".parse::<ConflictStrategy>(),
            Err(FeedError::UnknownStrategy(name)) if name == "newest"
        ));
    }

    #[test]
    fn test_strategy_deserializes_kebab_case() {
        let strategy: ConflictStrategy = serde_json::from_str("\"local-priority\"").unwrap();
        assert_eq!(strategy, ConflictStrategy::LocalPriority);
        assert_eq!(ConflictStrategy::default(), ConflictStrategy::LatestWins);
    }

    #[test]
    fn test_latest_wins() {
        assert_eq!(LatestWins.resolve(&edit(100), &update(90)), Resolution::KeepLocal);
        assert_eq!(LatestWins.resolve(&edit(80), &update(90)), Resolution::AdoptRemote);
        // Tie goes to the service
        assert_eq!(LatestWins.resolve(&edit(90), &update(90)), Resolution::AdoptRemote);
    }

    #[test]
    fn test_fixed_strategies() {
        assert_eq!(LocalPriority.resolve(&edit(0), &update(90)), Resolution::KeepLocal);
        assert_eq!(Interactive.resolve(&edit(100), &update(90)), Resolution::Defer);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(ConflictOutcome::LocalWins.as_str(), "local_wins");
        assert_eq!(
            ConflictOutcome::Resolved(ConflictDecision::Merged(Price::ZERO)).as_str(),
            "resolved_merged"
        );
    }
}
