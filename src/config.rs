//! # Configuration
//!
//! Recognized configuration keys for the engine, with defaults that suit a
//! single-node deployment. Loadable from JSON; unknown keys are rejected so
//! typos fail fast instead of silently falling back to defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Upstream
// =============================================================================

/// Which upstream adapter feeds the change streamer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpstreamType {
    /// A logical-replication-capable relational database.
    Postgres,
    /// A generic custom source (channel-backed adapter).
    Custom,
}

/// Upstream connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct UpstreamConfig {
    /// Adapter kind.
    #[serde(rename = "type")]
    pub source_type: UpstreamType,
    /// Connection string or path, adapter-specific.
    #[serde(default)]
    pub db: String,
    /// Upstream connection pool size.
    #[serde(default = "default_max_conns")]
    pub max_conns: u32,
}

fn default_max_conns() -> u32 {
    5
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            source_type: UpstreamType::Custom,
            db: String::new(),
            max_conns: default_max_conns(),
        }
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log settings, consumed by the embedding binary's tracing subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct LogConfig {
    /// Level filter string (`error`..`trace`).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// =============================================================================
// Config
// =============================================================================

/// Engine configuration. Every field has a default; a default `Config`
/// describes an in-process engine fed by a custom source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// Upstream change source.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Path of the replica SQLite file. Empty means in-memory (tests).
    #[serde(default)]
    pub replica_file: String,

    /// Port the change streamer listens on for subscriber connections.
    #[serde(default = "default_change_streamer_port")]
    pub change_streamer_port: u16,

    /// Shard identifier; prefixes poke ids so multiple shards can feed one
    /// client without colliding.
    #[serde(default = "default_shard")]
    pub shard: String,

    /// Whether an upstream `resetRequired` signal wipes the replica and
    /// re-runs initial sync automatically.
    #[serde(default)]
    pub auto_reset: bool,

    /// Whether to bulk-load an upstream snapshot before streaming.
    #[serde(default = "default_true")]
    pub initial_sync: bool,

    /// Logging.
    #[serde(default)]
    pub log: LogConfig,

    /// Milliseconds the view syncer waits to batch rapid upstream commits
    /// before recomputing views.
    #[serde(default = "default_debounce_delay_ms")]
    pub debounce_delay_ms: u64,

    /// Watchdog interval; a pipeline task silent for longer is restarted.
    #[serde(default = "default_watchdog_timer_ms")]
    pub watchdog_timer_ms: u64,

    /// Maximum concurrent streamer subscribers.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Floor of the upstream retry backoff ladder.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    /// Ceiling of the upstream retry backoff ladder.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_change_streamer_port() -> u16 {
    4849
}

fn default_shard() -> String {
    "0".to_string()
}

fn default_true() -> bool {
    true
}

fn default_debounce_delay_ms() -> u64 {
    10
}

fn default_watchdog_timer_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    128
}

fn default_min_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes to defaults")
    }
}

impl Config {
    /// Parses a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation.
    pub fn validate(&self) -> Result<()> {
        if self.min_delay_ms == 0 || self.min_delay_ms > self.max_delay_ms {
            return Err(Error::Config {
                reason: format!(
                    "minDelayMs ({}) must be positive and <= maxDelayMs ({})",
                    self.min_delay_ms, self.max_delay_ms
                ),
            });
        }
        if self.max_connections == 0 {
            return Err(Error::Config {
                reason: "maxConnections must be positive".to_string(),
            });
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.upstream.source_type, UpstreamType::Custom);
        assert!(config.initial_sync);
        assert!(!config.auto_reset);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn parses_recognized_keys() {
        let config = Config::from_json(
            r#"{
                "upstream": {"type": "postgres", "db": "postgres://up", "maxConns": 9},
                "replicaFile": "/tmp/replica.db",
                "changeStreamerPort": 5000,
                "shard": "7",
                "autoReset": true,
                "log": {"level": "debug"},
                "minDelayMs": 10,
                "maxDelayMs": 500
            }"#,
        )
        .unwrap();
        assert_eq!(config.upstream.source_type, UpstreamType::Postgres);
        assert_eq!(config.upstream.max_conns, 9);
        assert_eq!(config.change_streamer_port, 5000);
        assert_eq!(config.shard, "7");
        assert!(config.auto_reset);
        assert_eq!(config.min_delay_ms, 10);
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(Config::from_json(r#"{"replicaFiel": "typo.db"}"#).is_err());
    }

    #[test]
    fn rejects_inverted_backoff_bounds() {
        let err = Config::from_json(r#"{"minDelayMs": 800, "maxDelayMs": 100}"#).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
