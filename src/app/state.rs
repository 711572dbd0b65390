use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

use crate::app::config::AppConfig;
use crate::error::Result;
use crate::generation::GenerationService;
use crate::models::manager::AdapterManager;
use crate::platform::AppPaths;
use crate::quota::{QuotaLedger, QuotaMeter};

pub struct AppState {
    config: Arc<RwLock<AppConfig>>,
    paths: AppPaths,
    manager: Arc<AdapterManager>,
    service: GenerationService,
}

impl AppState {
    pub fn new(config: AppConfig, paths: AppPaths, ledger: Arc<dyn QuotaLedger>) -> Result<Self> {
        info!("Initializing application state");

        let manager = Arc::new(AdapterManager::from_configs(
            config.providers.clone(),
            config.default_provider.clone(),
            config.resilience.to_settings(),
        )?);
        let meter = QuotaMeter::new(ledger, config.quota.enabled);
        let service = GenerationService::new(manager.clone(), meter);

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            paths,
            manager,
            service,
        })
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Apply `updater`, validate, swap the provider registry and persist.
    /// Resilience and quota settings take effect on the next start.
    pub async fn update_config<F>(&self, updater: F) -> Result<()>
    where
        F: FnOnce(&mut AppConfig),
    {
        debug!("Updating application configuration");

        let mut updated = self.get_config();
        updater(&mut updated);
        updated.validate()?;

        self.manager
            .reload(updated.providers.clone(), updated.default_provider.clone())?;
        *self.config.write() = updated.clone();

        updated.save(&self.paths).await?;

        info!("Configuration updated and saved");
        Ok(())
    }

    pub fn get_paths(&self) -> &AppPaths {
        &self.paths
    }

    pub fn manager(&self) -> &Arc<AdapterManager> {
        &self.manager
    }

    pub fn service(&self) -> &GenerationService {
        &self.service
    }
}
