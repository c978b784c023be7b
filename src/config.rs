//! Application configuration.
//!
//! Layered the same way everywhere: `.env` via dotenvy first, then an
//! optional `marketflow.toml`, then per-provider environment overrides
//! (`ALPHAVANTAGE_API_KEY` etc.). A provider without an API key stays in the
//! registry as disabled rather than failing startup.

use anyhow::{Context, Result};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Recognised per-provider options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Request timeout in seconds.
    pub timeout: u64,
    pub max_retries: u32,
    /// Base retry delay in seconds; doubles per attempt.
    pub retry_delay: u64,
    pub rate_limit_calls: u32,
    /// Rate-limit window in seconds.
    pub rate_limit_window: u64,
    /// When the bucket is exhausted: wait (true) or fail rate_limited (false).
    pub wait_on_limit: bool,
    pub enabled: bool,
    pub priority: i32,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout: 30,
            max_retries: 3,
            retry_delay: 2,
            rate_limit_calls: 5,
            rate_limit_window: 60,
            wait_on_limit: true,
            enabled: true,
            priority: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Authoritative provider choice.
    pub primary_data_provider: Option<String>,
    pub fallback_data_provider: Option<String>,
    /// Legacy option, read only when `primary_data_provider` is absent.
    pub default_data_provider: Option<String>,
    /// Daily scheduled run, "HH:MM" local to the process.
    pub schedule_time: String,
    /// Periodic tick interval in seconds.
    pub periodic_tick_interval: u64,
    pub worker_concurrency: usize,
    pub backfill_lookback_daily: i64,
    pub backfill_lookback_intraday: i64,
    /// Minimum |estimate| below which earnings surprise% is left absent.
    pub surprise_epsilon: f64,
    /// Intraday move beyond this many sigmas is flagged as an outlier.
    pub outlier_sigma: f64,
    /// Fallback cooldown for the composite provider, seconds.
    pub fallback_cooldown: u64,
    pub db_path: PathBuf,
    pub providers: HashMap<String, ProviderSettings>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            primary_data_provider: None,
            fallback_data_provider: None,
            default_data_provider: None,
            schedule_time: "17:30".to_string(),
            periodic_tick_interval: 60,
            worker_concurrency: 8,
            backfill_lookback_daily: 10,
            backfill_lookback_intraday: 2,
            surprise_epsilon: 0.01,
            outlier_sigma: 6.0,
            fallback_cooldown: 300,
            db_path: PathBuf::from("marketflow.db"),
            providers: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the conventional locations: `.env`, then
    /// `$MARKETFLOW_CONFIG` or `./marketflow.toml` when present, then
    /// environment overrides.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = std::env::var("MARKETFLOW_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("marketflow.toml"));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// `MARKETFLOW_DB` plus `<PROVIDER>_API_KEY` for every configured or
    /// known provider name.
    fn apply_env_overrides(&mut self) {
        if let Ok(db) = std::env::var("MARKETFLOW_DB") {
            self.db_path = PathBuf::from(db);
        }
        for name in ["yahoo", "alphavantage", "fmp"] {
            let var = format!("{}_API_KEY", name.to_uppercase());
            if let Ok(key) = std::env::var(&var) {
                if !key.is_empty() {
                    self.providers.entry(name.to_string()).or_default().api_key = Some(key);
                }
            }
        }
    }

    /// The authoritative primary provider name: `primary_data_provider`,
    /// falling back to the legacy `default_data_provider`.
    pub fn primary_provider(&self) -> Option<&str> {
        self.primary_data_provider
            .as_deref()
            .or(self.default_data_provider.as_deref())
    }

    pub fn provider_settings(&self, name: &str) -> ProviderSettings {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    /// Parsed `schedule_time`; invalid strings fall back to 17:30.
    pub fn schedule_time_parsed(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.schedule_time, "%H:%M")
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(17, 30, 0).expect("valid time"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_falls_back_to_legacy_default() {
        let mut config = AppConfig::default();
        assert_eq!(config.primary_provider(), None);

        config.default_data_provider = Some("yahoo".into());
        assert_eq!(config.primary_provider(), Some("yahoo"));

        config.primary_data_provider = Some("alphavantage".into());
        assert_eq!(config.primary_provider(), Some("alphavantage"));
    }

    #[test]
    fn schedule_time_parses_and_defaults() {
        let mut config = AppConfig::default();
        config.schedule_time = "09:15".into();
        assert_eq!(
            config.schedule_time_parsed(),
            NaiveTime::from_hms_opt(9, 15, 0).unwrap()
        );
        config.schedule_time = "bogus".into();
        assert_eq!(
            config.schedule_time_parsed(),
            NaiveTime::from_hms_opt(17, 30, 0).unwrap()
        );
    }

    #[test]
    fn toml_round_trip_preserves_provider_settings() {
        let raw = r#"
            primary_data_provider = "alphavantage"
            fallback_data_provider = "yahoo"
            schedule_time = "17:30"

            [providers.alphavantage]
            api_key = "demo"
            rate_limit_calls = 5
            rate_limit_window = 60
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.primary_provider(), Some("alphavantage"));
        let settings = config.provider_settings("alphavantage");
        assert_eq!(settings.api_key.as_deref(), Some("demo"));
        assert_eq!(settings.rate_limit_calls, 5);
        // Unlisted providers get defaults.
        assert!(config.provider_settings("fmp").api_key.is_none());
    }
}
