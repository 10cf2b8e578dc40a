use crate::config::Config;
use crate::pipeline::IngestStats;
use crate::registry::Registry;
use crate::store::EventStore;
use crate::supervisor::StreamSupervisor;
use sqlx::SqlitePool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub registry: Registry,
    pub events: EventStore,
    pub supervisor: Arc<StreamSupervisor>,
    pub stats: Arc<IngestStats>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: SqlitePool,
        supervisor: Arc<StreamSupervisor>,
        stats: Arc<IngestStats>,
    ) -> Self {
        Self {
            config,
            registry: Registry::new(db.clone()),
            events: EventStore::new(db),
            supervisor,
            stats,
        }
    }
}
