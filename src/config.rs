// =============================================================================
// Engine configuration — JSON file with atomic save, env overrides in main
// =============================================================================
//
// Every field carries `#[serde(default)]` so adding new fields never breaks
// loading an older config file. Persistence uses the tmp + rename pattern to
// prevent corruption on crash.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_channels() -> Vec<String> {
    vec![
        "price".to_string(),
        "ticker".to_string(),
        "kline_1h".to_string(),
    ]
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_poll_concurrency() -> usize {
    6
}

fn default_staleness_ms() -> i64 {
    10_000
}

fn default_cache_size() -> usize {
    20
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_history_limit() -> usize {
    1_000
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_indicator_workers() -> usize {
    2
}

fn default_public_ws_url() -> String {
    "wss://fapi.bitunix.com/public/".to_string()
}

fn default_private_ws_url() -> String {
    "wss://fapi.bitunix.com/private/".to_string()
}

// =============================================================================
// EngineConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Symbols registered at startup.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Channels registered for every startup symbol.
    #[serde(default = "default_channels")]
    pub channels: Vec<String>,

    /// Per-pair REST re-poll interval. Values below 2 s are clamped up.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Concurrent REST request cap, shared by polling and history loads.
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,

    /// Push data older than this triggers the REST fallback for a symbol.
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: i64,

    /// Symbols kept in the in-memory cache before LRU eviction.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Idle time before a symbol is swept from the cache.
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Target candle depth per (symbol, timeframe).
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Store flush cadence.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    #[serde(default = "default_indicator_workers")]
    pub indicator_workers: usize,

    #[serde(default = "default_public_ws_url")]
    pub public_ws_url: String,

    #[serde(default = "default_private_ws_url")]
    pub private_ws_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            channels: default_channels(),
            poll_interval_secs: default_poll_interval_secs(),
            poll_concurrency: default_poll_concurrency(),
            staleness_ms: default_staleness_ms(),
            cache_size: default_cache_size(),
            cache_ttl_secs: default_cache_ttl_secs(),
            history_limit: default_history_limit(),
            flush_interval_ms: default_flush_interval_ms(),
            indicator_workers: default_indicator_workers(),
            public_ws_url: default_public_ws_url(),
            private_ws_url: default_private_ws_url(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            cache_size = config.cache_size,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist to `path` atomically (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved");
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
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "symbols": ["BTCUSDT"], "cache_size": 5 }"#).unwrap();
        assert_eq!(config.symbols, vec!["BTCUSDT"]);
        assert_eq!(config.cache_size, 5);
        assert_eq!(config.poll_interval_secs, default_poll_interval_secs());
        assert_eq!(config.history_limit, default_history_limit());
    }

    #[test]
    fn empty_object_is_fully_defaulted() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.poll_concurrency, 6);
        assert_eq!(config.staleness_ms, 10_000);
        assert_eq!(config.flush_interval_ms, 100);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join("marketfeed-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");

        let mut config = EngineConfig::default();
        config.symbols = vec!["ETHUSDT".to_string()];
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.symbols, vec!["ETHUSDT"]);
        std::fs::remove_file(&path).ok();
    }
}
