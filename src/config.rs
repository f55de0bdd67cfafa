// =============================================================================
// App Config — non-secret, app-wide settings with atomic save
// =============================================================================
//
// Per-pair settings live in the state store (`PairRecord`/`StrategySettings`),
// not here. This file holds the handful of settings that apply before any
// pair exists: the default symbol list offered on first boot, rate-limiter
// tuning, and the bind address the API listens on.
//
// Persistence uses the same atomic tmp + rename pattern as the teacher's
// runtime config: every field carries `#[serde(default = "...")]` so that
// adding a field never breaks loading an older file.
//
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
    ]
}

fn default_rate_limit_weight_per_minute() -> u32 {
    1200
}

fn default_rate_limit_orders_per_10s() -> u32 {
    50
}

fn default_max_parallel_backtest_tasks() -> usize {
    crate::backtest::optimizer::DEFAULT_MAX_PARALLEL_TASKS
}

/// Non-secret app-wide settings. Every field has a serde default so that
/// older JSON files missing new fields still deserialize correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Address the REST/WS API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Symbols offered in the operator UI on first boot, before any pair
    /// has been added.
    #[serde(default = "default_symbols")]
    pub default_symbols: Vec<String>,

    /// Exchange request-weight budget per minute, passed to the token-bucket
    /// rate limiter.
    #[serde(default = "default_rate_limit_weight_per_minute")]
    pub rate_limit_weight_per_minute: u32,

    /// Exchange order-placement budget per 10 seconds.
    #[serde(default = "default_rate_limit_orders_per_10s")]
    pub rate_limit_orders_per_10s: u32,

    /// Concurrency bound for grid-search backtests.
    #[serde(default = "default_max_parallel_backtest_tasks")]
    pub max_parallel_backtest_tasks: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            default_symbols: default_symbols(),
            rate_limit_weight_per_minute: default_rate_limit_weight_per_minute(),
            rate_limit_orders_per_10s: default_rate_limit_orders_per_10s(),
            max_parallel_backtest_tasks: default_max_parallel_backtest_tasks(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read app config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse app config from {}", path.display()))?;

        info!(path = %path.display(), bind_addr = %config.bind_addr, "app config loaded");
        Ok(config)
    }

    /// Load from `path`, falling back to defaults (and persisting them) if
    /// the file does not exist yet.
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let config = Self::default();
            config.save(path)?;
            info!(path = %path.display(), "app config not found, wrote defaults");
            Ok(config)
        }
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialize app config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "app config saved (atomic)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.default_symbols.len(), 3);
        assert_eq!(cfg.rate_limit_weight_per_minute, 1200);
        assert_eq!(cfg.max_parallel_backtest_tasks, 4);
    }

    #[test]
    fn deserialize_empty_json_uses_defaults() {
        let cfg: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.rate_limit_orders_per_10s, 50);
    }

    #[test]
    fn deserialize_partial_json_fills_defaults() {
        let json = r#"{ "bind_addr": "127.0.0.1:9000" }"#;
        let cfg: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.default_symbols.len(), 3);
    }

    #[test]
    fn roundtrip_serialization() {
        let cfg = AppConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.bind_addr, cfg2.bind_addr);
        assert_eq!(cfg.default_symbols, cfg2.default_symbols);
    }

    #[test]
    fn load_or_init_writes_defaults_when_missing() {
        let dir = std::env::temp_dir().join(format!("meridian-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("app_config.json");
        if path.exists() {
            std::fs::remove_file(&path).unwrap();
        }

        let cfg = AppConfig::load_or_init(&path).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert!(path.exists());

        std::fs::remove_file(&path).unwrap();
    }
}
