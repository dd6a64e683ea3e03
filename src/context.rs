use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::config::AppConfig;
use crate::core::engine::{BackupEngine, SimulatedEngine, SubprocessEngine};
use crate::core::inventory::{ConfigStore, TomlInventory};
use crate::core::locks::ResourceLocks;
use crate::core::plugin::{PluginRegistry, SimulatedPlugin};
use crate::core::progress::ProgressTracker;
use crate::db::{self, ExecutionLog};

/// Shared handles every component works from.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub inventory: Arc<dyn ConfigStore>,
    pub plugins: PluginRegistry,
    pub engine: Arc<dyn BackupEngine>,
    pub log: ExecutionLog,
    pub progress: ProgressTracker,
    pub locks: ResourceLocks,
}

impl AppContext {
    pub fn new(
        config: AppConfig,
        inventory: Arc<dyn ConfigStore>,
        plugins: PluginRegistry,
        engine: Arc<dyn BackupEngine>,
        log: ExecutionLog,
    ) -> Self {
        Self {
            config: Arc::new(config),
            inventory,
            plugins,
            engine,
            log,
            progress: ProgressTracker::new(),
            locks: ResourceLocks::new(),
        }
    }

    /// Wire up the daemon. Simulation swaps in in-process plugins and engine.
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let log = db::init(&config.execution_log).await?;
        let inventory: Arc<dyn ConfigStore> =
            Arc::new(TomlInventory::new(config.inventory_path.clone()));

        let (plugins, engine): (PluginRegistry, Arc<dyn BackupEngine>) = if config.simulation {
            info!("Simulation mode: no devices are contacted and no engine is spawned");
            (
                PluginRegistry::uniform(Arc::new(SimulatedPlugin::new(
                    config.staging_root.clone(),
                ))),
                Arc::new(SimulatedEngine::new()),
            )
        } else {
            (
                PluginRegistry::from_config(&config),
                Arc::new(SubprocessEngine::new(config.engine.clone())),
            )
        };

        Ok(Self::new(config, inventory, plugins, engine, log))
    }
}
