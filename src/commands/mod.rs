//! Transport-agnostic command surface.
//!
//! Each command is an `execute` function over the shared [`AppContext`],
//! returning a typed response. A thin CLI (or any other transport) adapts
//! these; parameter structs carry their own garde validation.

pub mod audit;
pub mod fetch_historical;
pub mod readiness;
pub mod refresh;
pub mod reports;
pub mod response_types;
pub mod sources;
pub mod workflows;

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::config::AppConfig;
use crate::provider::registry::ProviderRegistry;
use crate::refresh::manager::RefreshManager;
use crate::sched::Scheduler;
use crate::store::repository::Repository;
use crate::store::Database;
use crate::workflow::Orchestrator;

/// Everything a command needs, wired once at startup.
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub repo: Arc<Repository>,
    pub registry: Arc<ProviderRegistry>,
    pub manager: Arc<RefreshManager>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppContext {
    pub fn initialise(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let db = Database::open(&config.db_path)
            .with_context(|| format!("failed to open database: {}", config.db_path.display()))?;
        let repo = Arc::new(Repository::new(db.clone()));
        let registry = Arc::new(ProviderRegistry::from_config(&config));
        let manager = Arc::new(RefreshManager::new(
            repo.clone(),
            registry.clone(),
            config.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(db));
        Ok(Self {
            config,
            repo,
            registry,
            manager,
            orchestrator,
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.manager.clone(),
            self.orchestrator.clone(),
            self.repo.clone(),
            self.config.clone(),
        )
    }
}
