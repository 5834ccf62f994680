use std::sync::Arc;

use anyhow::Result;

use crate::config::AppConfig;
use crate::core::{Orchestrator, Scheduler};
use crate::db::{self, SqliteStore};

/// Everything the daemon wires together at startup.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub store: SqliteStore,
    pub orchestrator: Orchestrator,
    pub scheduler: Arc<Scheduler>,
}

impl AppContext {
    pub fn new(config: AppConfig, store: SqliteStore) -> Self {
        let config = Arc::new(config);
        let shared = Arc::new(store.clone());
        let orchestrator = Orchestrator::new(config.clone(), shared.clone(), shared);
        let scheduler = Arc::new(Scheduler::new(orchestrator.clone()));
        Self {
            config,
            store,
            orchestrator,
            scheduler,
        }
    }

    /// Open the configured database and build the context on top of it.
    pub async fn open(config: AppConfig) -> Result<Self> {
        let store = db::init(&config.database_path).await?;
        Ok(Self::new(config, store))
    }
}
