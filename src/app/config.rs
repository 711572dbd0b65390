use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::circuit_breaker::CircuitBreakerConfig;
use crate::models::factory::ProviderKind;
use crate::models::manager::{RateLimitScope, ResilienceSettings};
use crate::models::provider::ProviderConfig;
use crate::models::rate_limiter::RateLimiterConfig;
use crate::models::retry::RetryConfig;
use crate::platform::AppPaths;

/// Prefix for layered overrides, e.g. `QUILL__QUOTA__ENABLED=false`.
pub const ENV_PREFIX: &str = "QUILL";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub default_provider: Option<String>,
    pub resilience: ResilienceConfig,
    pub quota: QuotaConfig,
    pub logging: LoggingConfig,
    pub providers: Vec<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub retry: RetrySection,
    pub circuit_breaker: CircuitBreakerSection,
    pub rate_limit: RateLimitSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub max_failures: u32,
    pub reset_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    pub capacity: usize,
    pub refill_interval_ms: u64,
    pub scope: RateLimitScope,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
    /// Also write a daily-rolling file under the logs directory.
    pub file: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_retries: defaults.max_retries,
            initial_delay_ms: defaults.initial_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
            jitter: defaults.jitter,
        }
    }
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            max_failures: defaults.max_failures,
            reset_timeout_secs: defaults.reset_timeout.as_secs(),
        }
    }
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimiterConfig::default();
        Self {
            capacity: defaults.capacity,
            refill_interval_ms: defaults.refill_interval.as_millis() as u64,
            scope: RateLimitScope::default(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // Disabled until an API key is configured.
        let providers = vec![
            ProviderConfig::new("openai", "").with_priority(1).disabled(),
            ProviderConfig::new("anthropic", "").with_priority(2).disabled(),
            ProviderConfig::new("gemini", "").with_priority(3).disabled(),
            ProviderConfig::new("wenxin", "").with_priority(4).disabled(),
        ];

        Self {
            default_provider: Some("openai".to_string()),
            resilience: ResilienceConfig::default(),
            quota: QuotaConfig::default(),
            logging: LoggingConfig::default(),
            providers,
        }
    }
}

impl ResilienceConfig {
    pub fn to_settings(&self) -> ResilienceSettings {
        ResilienceSettings {
            retry: RetryConfig {
                max_retries: self.retry.max_retries,
                initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
                backoff_factor: self.retry.backoff_factor,
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter: self.retry.jitter,
            },
            circuit_breaker: CircuitBreakerConfig {
                max_failures: self.circuit_breaker.max_failures,
                reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_secs),
            },
            rate_limit: RateLimiterConfig {
                capacity: self.rate_limit.capacity,
                refill_interval: Duration::from_millis(self.rate_limit.refill_interval_ms),
            },
            rate_limit_scope: self.rate_limit.scope,
        }
    }
}

impl AppConfig {
    /// Load the user's configuration, writing the defaults on first run.
    pub async fn load(paths: &AppPaths) -> Result<Self> {
        let config_file = paths.config_file();

        if !config_file.exists() {
            info!("Config file not found, creating default configuration");
            Self::default().save_to(&config_file).await?;
        }

        Self::load_from(&config_file)
    }

    /// File values layered under `QUILL__*` environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {:?}", path);

        let mut config: AppConfig = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.apply_env_credentials();
        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    pub async fn save(&self, paths: &AppPaths) -> Result<()> {
        self.save_to(&paths.config_file()).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        info!("Saving configuration to: {:?}", path);

        let content = toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(path, content).await?;

        info!("Configuration saved successfully");
        Ok(())
    }

    /// Fill empty credentials from `QUILL_<NAME>_API_KEY` and
    /// `QUILL_<NAME>_SECRET_KEY`.
    pub fn apply_env_credentials(&mut self) {
        for provider in &mut self.providers {
            let prefix = format!(
                "{}_{}",
                ENV_PREFIX,
                provider.name.to_ascii_uppercase().replace('-', "_")
            );

            if provider.credentials.api_key.is_empty() {
                if let Ok(key) = std::env::var(format!("{}_API_KEY", prefix)) {
                    debug!("Using API key from environment for '{}'", provider.name);
                    provider.credentials.api_key = key;
                }
            }
            if provider.credentials.secret_key.is_none() {
                if let Ok(secret) = std::env::var(format!("{}_SECRET_KEY", prefix)) {
                    provider.credentials.secret_key = Some(secret);
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for provider in &self.providers {
            if provider.name.trim().is_empty() {
                return Err(Error::validation("Provider with empty name"));
            }
            if !names.insert(provider.name.as_str()) {
                return Err(Error::validation(format!("Provider {} is configured twice", provider.name)));
            }
            let kind = ProviderKind::parse(provider.kind()).ok_or_else(|| {
                Error::validation(format!("Provider {} has unknown kind {}", provider.name, provider.kind()))
            })?;
            if provider.enabled && provider.credentials.api_key.trim().is_empty() {
                return Err(Error::validation(format!("Provider {} is enabled but has no API key", provider.name)));
            }
            if provider.enabled
                && kind == ProviderKind::Wenxin
                && provider.credentials.secret_key.as_deref().map_or(true, str::is_empty)
            {
                return Err(Error::validation(format!("Provider {} requires a secret key", provider.name)));
            }
        }

        if let Some(default) = &self.default_provider {
            if !names.contains(default.as_str()) {
                return Err(Error::validation(format!("Default provider {} is not configured", default)));
            }
        }

        let retry = &self.resilience.retry;
        if retry.backoff_factor < 1.0 {
            return Err(Error::validation("Retry backoff_factor must be at least 1.0"));
        }
        if !(0.0..=0.1).contains(&retry.jitter) {
            return Err(Error::validation("Retry jitter must be between 0 and 0.1"));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            return Err(Error::validation("Retry initial_delay_ms exceeds max_delay_ms"));
        }

        if self.resilience.circuit_breaker.max_failures == 0 {
            return Err(Error::validation("Circuit breaker max_failures must be positive"));
        }

        let rate_limit = &self.resilience.rate_limit;
        if rate_limit.capacity == 0 || rate_limit.refill_interval_ms == 0 {
            return Err(Error::validation("Rate limit capacity and refill interval must be positive"));
        }

        Ok(())
    }

    pub fn enabled_providers(&self) -> Vec<&ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled).collect()
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.enabled_providers().is_empty());
        assert_eq!(config.resilience.retry.max_retries, 3);
        assert_eq!(config.resilience.circuit_breaker.max_failures, 5);
    }

    #[test]
    fn test_settings_conversion() {
        let settings = ResilienceConfig::default().to_settings();
        assert_eq!(settings.retry.initial_delay, Duration::from_secs(1));
        assert_eq!(settings.retry.max_delay, Duration::from_secs(30));
        assert_eq!(settings.circuit_breaker.reset_timeout, Duration::from_secs(30));
        assert_eq!(settings.rate_limit.capacity, 100);
        assert_eq!(settings.rate_limit.refill_interval, Duration::from_millis(100));
        assert_eq!(settings.rate_limit_scope, RateLimitScope::Shared);
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
default_provider = "claude"

[resilience.rate_limit]
scope = "per_provider"

[[providers]]
name = "claude"
kind = "anthropic"
credentials = { api_key = "sk-test" }
models = ["claude-3-haiku-20240307"]
"#,
        )
        .unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.default_provider.as_deref(), Some("claude"));
        assert_eq!(config.resilience.rate_limit.scope, RateLimitScope::PerProvider);
        assert_eq!(config.resilience.retry.max_retries, 3);

        let claude = config.provider("claude").unwrap();
        assert!(claude.enabled);
        assert_eq!(claude.timeout_seconds, 60);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.default_provider = Some("mistral".to_string());
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.providers[0].enabled = true;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.resilience.retry.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.resilience.retry.jitter = 0.2;
        assert!(config.validate().is_err());
        config.resilience.retry.jitter = 0.1;
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.providers.push(ProviderConfig::new("openai", "key"));
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_first_load_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::from_root(dir.path());

        let config = AppConfig::load(&paths).await.unwrap();
        assert!(paths.config_file().exists());
        assert_eq!(config.providers.len(), 4);

        let reloaded = AppConfig::load_from(&paths.config_file()).unwrap();
        assert_eq!(reloaded.providers, config.providers);
    }
}
