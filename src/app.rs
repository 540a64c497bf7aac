//! Wires the store, queue and services together.

use std::sync::Arc;

use pipeline_dispatcher::{ChainExpander, HeartbeatMonitor, MetadataResolver, SchedulerService};
use pipeline_domain::ports::messaging::WorkQueue;
use pipeline_domain::repositories::{
    AttemptRepository, MetadataRepository, ProductRepository, TaskRepository,
};
use pipeline_domain::PipelineResult;
use pipeline_infrastructure::{
    DatabaseManager, InMemoryWorkQueue, SqliteAttemptRepository, SqliteMetadataRepository,
    SqliteProductRepository, SqliteTaskRepository,
};

use crate::config::AppConfig;

pub struct App {
    pub db: DatabaseManager,
    pub tasks: Arc<dyn TaskRepository>,
    pub attempts: Arc<dyn AttemptRepository>,
    pub queue: Arc<dyn WorkQueue>,
    pub scheduler: Arc<SchedulerService>,
    pub heartbeat_monitor: Arc<HeartbeatMonitor>,
}

impl App {
    pub async fn build(config: &AppConfig) -> PipelineResult<Self> {
        let db =
            DatabaseManager::open(&config.database.url, config.database.max_connections).await?;
        let pool = db.pool().clone();

        let tasks: Arc<dyn TaskRepository> = Arc::new(SqliteTaskRepository::new(pool.clone()));
        let attempts: Arc<dyn AttemptRepository> =
            Arc::new(SqliteAttemptRepository::new(pool.clone()));
        let products: Arc<dyn ProductRepository> =
            Arc::new(SqliteProductRepository::new(pool.clone()));
        let metadata: Arc<dyn MetadataRepository> = Arc::new(SqliteMetadataRepository::new(pool));
        let queue: Arc<dyn WorkQueue> = Arc::new(InMemoryWorkQueue::new());

        let resolver = Arc::new(MetadataResolver::new(tasks.clone(), metadata.clone()));
        let expander = Arc::new(ChainExpander::new(
            products.clone(),
            metadata.clone(),
            resolver.clone(),
        ));
        let scheduler = Arc::new(SchedulerService::new(
            tasks.clone(),
            attempts.clone(),
            products.clone(),
            metadata.clone(),
            queue.clone(),
            expander,
            resolver.clone(),
            config.retry_policy(),
            config.scheduler_config(),
        ));
        let heartbeat_monitor = Arc::new(HeartbeatMonitor::new(
            attempts.clone(),
            config.heartbeat_timeout(),
            config.queued_timeout(),
            config.heartbeat_check_interval(),
        ));

        Ok(Self {
            db,
            tasks,
            attempts,
            queue,
            scheduler,
            heartbeat_monitor,
        })
    }
}
