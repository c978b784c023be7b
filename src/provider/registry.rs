//! Provider registry.
//!
//! Owns construction of every configured provider, knows which capabilities
//! each one declares, and exposes the composite primary/fallback pair as a
//! single logical provider. Availability answers are cached for 60 seconds
//! so health checks never amplify traffic.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;

use super::alphavantage::AlphaVantageProvider;
use super::composite::CompositeProvider;
use super::fmp::FmpProvider;
use super::yahoo::YahooProvider;
use super::{Capability, ErrorKind, ProviderClient, ProviderError, ProviderResult};

const HEALTH_CACHE_TTL: Duration = Duration::from_secs(60);

struct HealthEntry {
    available: bool,
    checked_at: Instant,
}

pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderClient>>,
    /// Providers configured but unusable (missing API key etc.), with the
    /// reason. Surfaced by the sources command instead of failing startup.
    disabled: HashMap<String, String>,
    primary_name: Option<String>,
    fallback_name: Option<String>,
    fallback_cooldown: Duration,
    health: DashMap<String, HealthEntry>,
    /// Built lazily so the composite's cooldown state survives across calls.
    routed_cache: std::sync::Mutex<Option<Arc<dyn ProviderClient>>>,
}

impl ProviderRegistry {
    /// Build every known provider from configuration. Providers that fail to
    /// construct are registered as disabled, not dropped silently.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut providers: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();
        let mut disabled: HashMap<String, String> = HashMap::new();

        let yahoo_settings = config.provider_settings(YahooProvider::NAME);
        if yahoo_settings.enabled {
            match YahooProvider::new(&yahoo_settings) {
                Ok(provider) => {
                    providers.insert(YahooProvider::NAME.to_string(), Arc::new(provider));
                }
                Err(err) => {
                    disabled.insert(YahooProvider::NAME.to_string(), err.to_string());
                }
            }
        } else {
            disabled.insert(YahooProvider::NAME.to_string(), "disabled in config".into());
        }

        let av_settings = config.provider_settings(AlphaVantageProvider::NAME);
        if av_settings.enabled {
            match AlphaVantageProvider::new(&av_settings, config.surprise_epsilon) {
                Ok(provider) => {
                    providers.insert(AlphaVantageProvider::NAME.to_string(), Arc::new(provider));
                }
                Err(err) => {
                    tracing::warn!(
                        provider = AlphaVantageProvider::NAME,
                        "provider disabled: {err}"
                    );
                    disabled.insert(AlphaVantageProvider::NAME.to_string(), err.to_string());
                }
            }
        } else {
            disabled.insert(
                AlphaVantageProvider::NAME.to_string(),
                "disabled in config".into(),
            );
        }

        let fmp_settings = config.provider_settings(FmpProvider::NAME);
        if fmp_settings.enabled {
            match FmpProvider::new(&fmp_settings, config.surprise_epsilon) {
                Ok(provider) => {
                    providers.insert(FmpProvider::NAME.to_string(), Arc::new(provider));
                }
                Err(err) => {
                    tracing::warn!(provider = FmpProvider::NAME, "provider disabled: {err}");
                    disabled.insert(FmpProvider::NAME.to_string(), err.to_string());
                }
            }
        } else {
            disabled.insert(FmpProvider::NAME.to_string(), "disabled in config".into());
        }

        let primary_name = config
            .primary_provider()
            .filter(|name| providers.contains_key(*name))
            .map(std::string::ToString::to_string)
            .or_else(|| {
                // No usable configured primary: fall back to yahoo when built.
                providers
                    .contains_key(YahooProvider::NAME)
                    .then(|| YahooProvider::NAME.to_string())
            });

        let fallback_name = config
            .fallback_data_provider
            .as_deref()
            .filter(|name| providers.contains_key(*name))
            .filter(|name| Some(*name) != primary_name.as_deref())
            .map(std::string::ToString::to_string);

        Self {
            providers,
            disabled,
            primary_name,
            fallback_name,
            fallback_cooldown: Duration::from_secs(config.fallback_cooldown),
            health: DashMap::new(),
            routed_cache: std::sync::Mutex::new(None),
        }
    }

    /// Register a provider directly. Construction seam for tests and custom
    /// wiring.
    pub fn insert(&mut self, name: &str, provider: Arc<dyn ProviderClient>) {
        self.providers.insert(name.to_string(), provider);
        *self.routed_cache.lock().expect("routed cache lock") = None;
    }

    pub fn set_routing(&mut self, primary: Option<String>, fallback: Option<String>) {
        self.primary_name = primary;
        self.fallback_name = fallback;
        *self.routed_cache.lock().expect("routed cache lock") = None;
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProviderClient>> {
        self.providers.get(name).cloned()
    }

    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn disabled_providers(&self) -> &HashMap<String, String> {
        &self.disabled
    }

    pub fn primary_name(&self) -> Option<&str> {
        self.primary_name.as_deref()
    }

    pub fn fallback_name(&self) -> Option<&str> {
        self.fallback_name.as_deref()
    }

    pub fn capabilities_of(&self, name: &str) -> Vec<Capability> {
        self.providers
            .get(name)
            .map(|p| p.capabilities().to_vec())
            .unwrap_or_default()
    }

    /// The routing entry point used by the refresh manager: the composite
    /// pair when a fallback is configured, otherwise the primary alone.
    pub fn routed(&self) -> ProviderResult<Arc<dyn ProviderClient>> {
        if let Some(cached) = self
            .routed_cache
            .lock()
            .expect("routed cache lock")
            .clone()
        {
            return Ok(cached);
        }

        let primary_name = self.primary_name.as_deref().ok_or_else(|| {
            ProviderError::new(
                "registry",
                ErrorKind::Unknown,
                "no usable primary provider configured",
            )
        })?;
        let primary = self.get(primary_name).ok_or_else(|| {
            ProviderError::new(
                "registry",
                ErrorKind::Unknown,
                format!("primary provider not registered: {primary_name}"),
            )
        })?;

        let routed: Arc<dyn ProviderClient> =
            match self.fallback_name.as_deref().and_then(|n| self.get(n)) {
                Some(fallback) => {
                    // AlphaVantage's free tier covers fewer symbols than
                    // Yahoo; treat any non-yahoo primary as the narrow side.
                    let narrow = primary.name() != YahooProvider::NAME;
                    Arc::new(CompositeProvider::new(
                        primary,
                        fallback,
                        self.fallback_cooldown,
                        narrow,
                    ))
                }
                None => primary,
            };
        *self.routed_cache.lock().expect("routed cache lock") = Some(routed.clone());
        Ok(routed)
    }

    /// Cached `is_available`: one probe per provider per 60 s window, shared
    /// across workers. A failed probe only poisons the cache until the TTL
    /// lapses.
    pub async fn is_available_cached(&self, name: &str) -> bool {
        if let Some(entry) = self.health.get(name) {
            if entry.checked_at.elapsed() < HEALTH_CACHE_TTL {
                return entry.available;
            }
        }
        let Some(provider) = self.get(name) else {
            return false;
        };
        let available = provider.is_available().await;
        self.health.insert(
            name.to_string(),
            HealthEntry {
                available,
                checked_at: Instant::now(),
            },
        );
        available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingProbe {
        probes: AtomicU32,
    }

    #[async_trait]
    impl ProviderClient for CountingProbe {
        fn name(&self) -> &str {
            "probe"
        }

        fn capabilities(&self) -> &'static [Capability] {
            &[Capability::PriceData]
        }

        async fn is_available(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn last_error(&self) -> Option<String> {
            None
        }
    }

    fn config_with_keys() -> AppConfig {
        let mut config = AppConfig::default();
        config.primary_data_provider = Some("alphavantage".into());
        config.fallback_data_provider = Some("yahoo".into());
        config.providers.insert(
            "alphavantage".into(),
            ProviderSettings {
                api_key: Some("demo".into()),
                ..ProviderSettings::default()
            },
        );
        config
    }

    #[test]
    fn builds_configured_providers_and_disables_keyless() {
        let registry = ProviderRegistry::from_config(&config_with_keys());
        assert!(registry.get("alphavantage").is_some());
        assert!(registry.get("yahoo").is_some());
        // fmp has no key, lands in the disabled set.
        assert!(registry.get("fmp").is_none());
        assert!(registry.disabled_providers().contains_key("fmp"));
        assert_eq!(registry.primary_name(), Some("alphavantage"));
        assert_eq!(registry.fallback_name(), Some("yahoo"));
    }

    #[test]
    fn routed_builds_composite_pair() {
        let registry = ProviderRegistry::from_config(&config_with_keys());
        let routed = registry.routed().unwrap();
        assert_eq!(routed.name(), "alphavantage/yahoo");
        assert!(routed.supports(Capability::PriceData));
        assert!(routed.supports(Capability::News));
    }

    #[test]
    fn primary_missing_key_falls_back_to_yahoo() {
        let mut config = AppConfig::default();
        config.primary_data_provider = Some("alphavantage".into());
        let registry = ProviderRegistry::from_config(&config);
        assert_eq!(registry.primary_name(), Some("yahoo"));
        let routed = registry.routed().unwrap();
        assert_eq!(routed.name(), "yahoo");
    }

    #[tokio::test]
    async fn health_probe_cached_for_ttl() {
        let mut registry = ProviderRegistry::from_config(&AppConfig::default());
        let probe = Arc::new(CountingProbe {
            probes: AtomicU32::new(0),
        });
        registry.insert("probe", probe.clone());

        assert!(registry.is_available_cached("probe").await);
        assert!(registry.is_available_cached("probe").await);
        assert!(registry.is_available_cached("probe").await);
        assert_eq!(probe.probes.load(Ordering::SeqCst), 1);
    }
}
