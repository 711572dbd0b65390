use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{AdapterError, AdapterResult};
use crate::models::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};
use crate::models::error_handler::ErrorHandler;
use crate::models::factory::create_adapter;
use crate::models::provider::{ProviderAdapter, ProviderConfig};
use crate::models::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::models::retry::{RetryConfig, Retryer};

const SHARED_LIMITER_KEY: &str = "*";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    /// One bucket for every provider.
    #[default]
    Shared,
    PerProvider,
}

#[derive(Debug, Clone, Default)]
pub struct ResilienceSettings {
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimiterConfig,
    pub rate_limit_scope: RateLimitScope,
}

struct Registration {
    config: Arc<ProviderConfig>,
    /// `None` for disabled providers.
    adapter: Option<Arc<dyn ProviderAdapter>>,
}

#[derive(Default)]
struct Registry {
    providers: HashMap<String, Registration>,
    default_provider: Option<String>,
}

/// Provider summary for listings.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderInfo {
    pub name: String,
    pub kind: String,
    pub priority: i32,
    pub enabled: bool,
    pub streaming: bool,
    pub models: Vec<String>,
}

/// Registry of provider adapters plus the per-provider resilience state.
pub struct AdapterManager {
    registry: RwLock<Registry>,
    settings: ResilienceSettings,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl AdapterManager {
    pub fn new(settings: ResilienceSettings) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            settings,
            breakers: Mutex::new(HashMap::new()),
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_configs(
        configs: Vec<ProviderConfig>,
        default_provider: Option<String>,
        settings: ResilienceSettings,
    ) -> AdapterResult<Self> {
        let manager = Self::new(settings);
        manager.reload(configs, default_provider)?;
        Ok(manager)
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    pub fn register(&self, config: ProviderConfig, adapter: Arc<dyn ProviderAdapter>) {
        let name = config.name.clone();
        let enabled = config.enabled;
        let mut registry = self.registry.write();
        registry.providers.insert(
            name.clone(),
            Registration {
                config: Arc::new(config),
                adapter: enabled.then_some(adapter),
            },
        );
        info!("Registered provider '{}' (enabled: {})", name, enabled);
    }

    pub fn unregister(&self, name: &str) -> bool {
        let mut registry = self.registry.write();
        let removed = registry.providers.remove(name).is_some();
        if removed {
            if registry.default_provider.as_deref() == Some(name) {
                registry.default_provider = None;
                warn!("Default provider '{}' was unregistered", name);
            }
            info!("Unregistered provider '{}'", name);
        }
        removed
    }

    pub fn set_default(&self, name: &str) -> AdapterResult<()> {
        let mut registry = self.registry.write();
        if !registry.providers.contains_key(name) {
            return Err(AdapterError::invalid_request(name, format!("Provider '{}' is not registered", name))
                .with_code("UNKNOWN_PROVIDER"));
        }
        registry.default_provider = Some(name.to_string());
        info!("Default provider set to '{}'", name);
        Ok(())
    }

    pub fn default_provider(&self) -> Option<String> {
        self.registry.read().default_provider.clone()
    }

    /// Adapter by name; an empty name means the default provider.
    pub fn get_adapter(&self, name: &str) -> AdapterResult<Arc<dyn ProviderAdapter>> {
        let registry = self.registry.read();

        let name = if name.is_empty() {
            registry.default_provider.as_deref().ok_or_else(|| {
                AdapterError::invalid_request("manager", "No provider requested and no default provider configured")
                    .with_code("NO_DEFAULT_PROVIDER")
            })?
        } else {
            name
        };

        let registration = registry.providers.get(name).ok_or_else(|| {
            AdapterError::invalid_request(name, format!("Provider '{}' is not registered", name))
                .with_code("UNKNOWN_PROVIDER")
        })?;

        registration.adapter.clone().ok_or_else(|| {
            AdapterError::invalid_request(name, format!("Provider '{}' is disabled", name))
                .with_code("PROVIDER_DISABLED")
        })
    }

    /// First enabled provider, by ascending priority then name, that lists `model`.
    pub fn get_adapter_by_model(&self, model: &str) -> AdapterResult<Arc<dyn ProviderAdapter>> {
        let registry = self.registry.read();

        let mut candidates: Vec<&Registration> = registry
            .providers
            .values()
            .filter(|registration| registration.adapter.is_some())
            .collect();
        candidates.sort_by(|a, b| {
            a.config
                .priority
                .cmp(&b.config.priority)
                .then_with(|| a.config.name.cmp(&b.config.name))
        });

        candidates
            .into_iter()
            .filter_map(|registration| registration.adapter.as_ref())
            .find(|adapter| adapter.supports_model(model))
            .cloned()
            .ok_or_else(|| {
                AdapterError::invalid_request("manager", format!("No enabled provider supports model '{}'", model))
                    .with_code("UNSUPPORTED_MODEL")
            })
    }

    /// Build every adapter first, then swap the whole registry. A failure
    /// leaves the current registry untouched.
    pub fn reload(&self, configs: Vec<ProviderConfig>, default_provider: Option<String>) -> AdapterResult<()> {
        let mut providers = HashMap::with_capacity(configs.len());

        for config in configs {
            if providers.contains_key(&config.name) {
                return Err(AdapterError::invalid_request(
                    &config.name,
                    format!("Provider '{}' is configured twice", config.name),
                )
                .with_code("DUPLICATE_PROVIDER"));
            }

            let adapter = if config.enabled {
                Some(create_adapter(&config)?)
            } else {
                debug!("Provider '{}' is disabled, registering without adapter", config.name);
                None
            };

            providers.insert(
                config.name.clone(),
                Registration {
                    config: Arc::new(config),
                    adapter,
                },
            );
        }

        if let Some(default) = &default_provider {
            if !providers.contains_key(default) {
                return Err(AdapterError::invalid_request(
                    default,
                    format!("Default provider '{}' is not configured", default),
                )
                .with_code("UNKNOWN_PROVIDER"));
            }
        }

        let count = providers.len();
        {
            let mut registry = self.registry.write();
            registry.providers = providers;
            registry.default_provider = default_provider;
        }

        info!("Loaded {} providers", count);
        Ok(())
    }

    /// Probe every enabled provider concurrently.
    pub async fn health_check(&self) -> HashMap<String, AdapterResult<()>> {
        let adapters: Vec<Arc<dyn ProviderAdapter>> = {
            let registry = self.registry.read();
            registry
                .providers
                .values()
                .filter_map(|registration| registration.adapter.clone())
                .collect()
        };

        let probes = adapters.into_iter().map(|adapter| async move {
            let result = adapter.health_check().await;
            match &result {
                Ok(()) => debug!("Provider '{}' is healthy", adapter.name()),
                Err(e) => warn!("Provider '{}' failed health check: {}", adapter.name(), e),
            }
            (adapter.name().to_string(), result)
        });

        join_all(probes).await.into_iter().collect()
    }

    pub fn providers(&self) -> Vec<ProviderInfo> {
        let registry = self.registry.read();
        let mut providers: Vec<ProviderInfo> = registry
            .providers
            .values()
            .map(|registration| ProviderInfo {
                name: registration.config.name.clone(),
                kind: registration.config.kind().to_string(),
                priority: registration.config.priority,
                enabled: registration.adapter.is_some(),
                streaming: registration
                    .adapter
                    .as_ref()
                    .is_some_and(|adapter| adapter.supports_streaming()),
                models: registration
                    .adapter
                    .as_ref()
                    .map(|adapter| adapter.supported_models())
                    .unwrap_or_else(|| registration.config.models.clone()),
            })
            .collect();
        providers.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        providers
    }

    /// Resilience pipeline for `provider`. The breaker is created on first
    /// use and outlives reloads; the limiter is shared or per provider.
    pub fn error_handler(&self, provider: &str) -> ErrorHandler {
        let breaker = self
            .breakers
            .lock()
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(provider, self.settings.circuit_breaker.clone()))
            })
            .clone();

        let limiter_key = match self.settings.rate_limit_scope {
            RateLimitScope::Shared => SHARED_LIMITER_KEY,
            RateLimitScope::PerProvider => provider,
        };
        let limiter = self
            .limiters
            .lock()
            .entry(limiter_key.to_string())
            .or_insert_with(|| Arc::new(RateLimiter::new(limiter_key, self.settings.rate_limit.clone())))
            .clone();

        ErrorHandler::new(limiter, breaker, Retryer::new(self.settings.retry.clone()))
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.lock().values().map(|breaker| breaker.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Stop every rate limiter's refill task.
    pub fn close(&self) {
        for limiter in self.limiters.lock().values() {
            limiter.close();
        }
    }
}

impl Drop for AdapterManager {
    fn drop(&mut self) {
        self.close();
    }
}
