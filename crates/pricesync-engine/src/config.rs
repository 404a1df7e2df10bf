//! Engine configuration.

use crate::error::{EngineError, EngineResult};
use pricesync_feed::ConflictStrategy;
use pricesync_ws::ConnectionConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Snapshot storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Snapshot file. Absent means memory-only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Engine configuration, loaded from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pricing stream URL.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// Pricing service REST base URL (polling and sync push).
    #[serde(default = "default_rest_url")]
    pub rest_url: String,

    /// Ping period while connected. Default: 30,000.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Inbound silence that forces a reconnect. Default: 45,000.
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Default: 1,000.
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Default: 60,000.
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Random jitter added to each backoff. Default: 0.
    #[serde(default)]
    pub reconnect_jitter_ms: u64,
    /// Consecutive failures before falling back to polling (0 = never). Default: 10.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Poll period once streaming is abandoned. Default: 5,000.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// `latest-wins`, `local-priority` or `interactive`.
    #[serde(default = "default_conflict_strategy")]
    pub conflict_strategy: String,
    /// Bounded recent-conflict history. Default: 64.
    #[serde(default = "default_conflict_history_limit")]
    pub conflict_history_limit: usize,
    /// Remote updates held per blocked id. Default: 256.
    #[serde(default = "default_conflict_queue_limit")]
    pub conflict_queue_limit: usize,

    /// Periodic sync push period. Default: 10,000.
    #[serde(default = "default_sync_interval_ms")]
    pub sync_interval_ms: u64,
    /// Pending edits older than this are pushed. Default: 5,000.
    #[serde(default = "default_sync_edit_age_threshold_ms")]
    pub sync_edit_age_threshold_ms: u64,
    /// Cap for per-edit retry backoff. Default: 300,000.
    #[serde(default = "default_sync_max_backoff_ms")]
    pub sync_max_backoff_ms: u64,

    /// Unwatched entities idle longer than this are evicted. Default: 24h.
    #[serde(default = "default_entity_retention_ms")]
    pub entity_retention_ms: u64,
    /// Upper bound for the final snapshot flush. Default: 2,000.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    /// Collaborator command queue capacity. Default: 1,024.
    #[serde(default = "default_command_queue_size")]
    pub command_queue_size: usize,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Ids the binary subscribes to at startup.
    #[serde(default)]
    pub watch_ids: Vec<String>,
}

fn default_ws_url() -> String {
    "ws://127.0.0.1:8080/prices/stream".to_string()
}

fn default_rest_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_heartbeat_timeout_ms() -> u64 {
    45_000
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

fn default_conflict_strategy() -> String {
    ConflictStrategy::default().to_string()
}

fn default_conflict_history_limit() -> usize {
    64
}

fn default_conflict_queue_limit() -> usize {
    256
}

fn default_sync_interval_ms() -> u64 {
    10_000
}

fn default_sync_edit_age_threshold_ms() -> u64 {
    5_000
}

fn default_sync_max_backoff_ms() -> u64 {
    300_000
}

fn default_entity_retention_ms() -> u64 {
    24 * 60 * 60 * 1_000
}

fn default_shutdown_grace_ms() -> u64 {
    2_000
}

fn default_command_queue_size() -> usize {
    1_024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ws_url: default_ws_url(),
            rest_url: default_rest_url(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_jitter_ms: 0,
            max_reconnect_attempts: default_max_reconnect_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            conflict_strategy: default_conflict_strategy(),
            conflict_history_limit: default_conflict_history_limit(),
            conflict_queue_limit: default_conflict_queue_limit(),
            sync_interval_ms: default_sync_interval_ms(),
            sync_edit_age_threshold_ms: default_sync_edit_age_threshold_ms(),
            sync_max_backoff_ms: default_sync_max_backoff_ms(),
            entity_retention_ms: default_entity_retention_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            command_queue_size: default_command_queue_size(),
            persistence: PersistenceConfig::default(),
            watch_ids: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> EngineResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parsed conflict strategy.
    pub fn strategy(&self) -> EngineResult<ConflictStrategy> {
        self.conflict_strategy
            .parse()
            .map_err(|e: pricesync_feed::FeedError| EngineError::Config(e.to_string()))
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        self.strategy()?;

        let positive = [
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("reconnect_base_delay_ms", self.reconnect_base_delay_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("sync_interval_ms", self.sync_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(EngineError::Config(format!("{name} must be > 0")));
            }
        }

        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(EngineError::Config(
                "reconnect_max_delay_ms must be >= reconnect_base_delay_ms".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(EngineError::Config(
                "heartbeat_timeout_ms must be >= heartbeat_interval_ms".to_string(),
            ));
        }
        if self.conflict_queue_limit == 0 {
            return Err(EngineError::Config("conflict_queue_limit must be > 0".to_string()));
        }
        if self.command_queue_size == 0 {
            return Err(EngineError::Config("command_queue_size must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.ws_url.clone(),
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_base_delay_ms: self.reconnect_base_delay_ms,
            reconnect_max_delay_ms: self.reconnect_max_delay_ms,
            reconnect_jitter_ms: self.reconnect_jitter_ms,
            heartbeat_interval_ms: self.heartbeat_interval_ms,
            heartbeat_timeout_ms: self.heartbeat_timeout_ms,
            poll_interval_ms: self.poll_interval_ms,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config.heartbeat_interval_ms, 30_000);
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.strategy().unwrap(), ConflictStrategy::LatestWins);
        assert!(config.persistence.path.is_none());
        assert_eq!(config.conflict_queue_limit, 256);
    }

    #[test]
    fn test_parse_full_config() {
        let config = EngineConfig::from_toml(
            r#"
            ws_url = "wss://prices.example.com/stream"
            rest_url = "https://prices.example.com"
            heartbeat_interval_ms = 10000
            reconnect_base_delay_ms = 500
            max_reconnect_attempts = 0
            poll_interval_ms = 2000
            conflict_strategy = "interactive"
            sync_interval_ms = 15000
            watch_ids = ["sku-1", "sku-2"]

            [persistence]
            path = "/var/lib/pricesync/state.json"
            "#,
        )
        .unwrap();

        assert_eq!(config.strategy().unwrap(), ConflictStrategy::Interactive);
        assert_eq!(config.max_reconnect_attempts, 0);
        assert_eq!(config.watch_ids.len(), 2);
        assert_eq!(
            config.persistence.path,
            Some(PathBuf::from("/var/lib/pricesync/state.json"))
        );

        let conn = config.connection_config();
        assert_eq!(conn.url, "wss://prices.example.com/stream");
        assert_eq!(conn.reconnect_policy().base_delay_ms, 500);
        assert_eq!(conn.poll_interval_ms, 2000);
    }

    #[test]
    fn test_unknown_strategy_is_fatal() {
        let err = EngineConfig::from_toml(r#"conflict_strategy = "newest-wins""#).unwrap_err();
        assert!(matches!(err, EngineError::Config(msg) if msg.contains("newest-wins")));
    }

    #[test]
    fn test_invalid_timings_rejected() {
        assert!(EngineConfig::from_toml("sync_interval_ms = 0").is_err());
        assert!(EngineConfig::from_toml("conflict_queue_limit = 0").is_err());
        assert!(EngineConfig::from_toml(
            "reconnect_base_delay_ms = 5000\nreconnect_max_delay_ms = 1000"
        )
        .is_err());
        assert!(EngineConfig::from_toml(
            "heartbeat_interval_ms = 5000\nheartbeat_timeout_ms = 1000"
        )
        .is_err());
    }

    #[test]
    fn test_shipped_example_config_parses() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/pricesync.toml");
        let config = EngineConfig::from_file(path).unwrap();
        assert_eq!(config.watch_ids, vec!["sku-42".to_string()]);
        assert!(config.persistence.path.is_some());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            EngineConfig::from_file("/nonexistent/pricesync.toml"),
            Err(EngineError::Config(_))
        ));
    }
}
