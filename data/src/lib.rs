//! # Till Data
//!
//! Local-first data layer for the Till point-of-sale client.
//!
//! Each entity type gets one local database, built lazily by the
//! [`DatabaseRegistry`] with its indexes in place. Reference data
//! (products, customers, operators) replicates both ways; orders are pushed
//! only once completed and are purged locally after the remote confirms
//! them. Replication health is collected by the [`SyncStatusAggregator`].
//!
//! [`DataLayer`] wires these together and is what applications hold.
//!
//! ```no_run
//! use std::sync::Arc;
//! use till_data::{Config, DataLayer, EntityType, MemoryServer};
//!
//! # async fn run() -> till_data::Result<()> {
//! let layer = DataLayer::new(Config::from_env()?, MemoryServer::new_shared());
//! let customers = layer.customers();
//! let jane = customers
//!     .create(serde_json::json!({"name": "Jane Doe", "document": "DOC123"}))
//!     .await?;
//! println!("{} @ {:?}", jane.id, jane.rev);
//! println!("{:?}", layer.get_sync_status(EntityType::Customers));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entity;
pub mod error;
pub mod events;
pub mod handle;
pub mod indexes;
pub mod orchestrator;
pub mod purge;
pub mod registry;
pub mod replication;
pub mod services;
pub mod status;
pub mod tracking;

pub use config::{Config, ConfigError, Credentials};
pub use entity::{EntityType, SyncMode};
pub use error::{ConflictKind, DataError, ReplicationError, ReplicationErrorKind, Result};
pub use events::{EventChannel, OrderEvent, SessionEvent, Subscription};
pub use handle::DatabaseHandle;
pub use indexes::{IndexManager, IndexTarget};
pub use orchestrator::{SyncOrchestrator, SyncReport};
pub use purge::{PurgePolicy, PurgeReport};
pub use registry::{DatabaseRegistry, DefaultStoreFactory, StoreFactory};
pub use replication::{
    Endpoint, MemoryRemote, MemoryServer, Remote, RemoteConnector, RetryPolicy, SyncOptions,
};
pub use services::{CustomerService, OperatorService, OrderService, OrderStatus, ProductService};
pub use status::{SyncPhase, SyncState, SyncStatistics, SyncStatus, SyncStatusAggregator};
pub use tracking::{tracked, ErrorTracker, TracingTracker};

use std::collections::BTreeMap;
use std::sync::Arc;

/// The data layer as seen by the rest of the application.
pub struct DataLayer {
    config: Arc<Config>,
    registry: Arc<DatabaseRegistry>,
    orchestrator: Arc<SyncOrchestrator>,
    status: Arc<SyncStatusAggregator>,
    tracker: Arc<dyn ErrorTracker>,
    order_events: Arc<EventChannel<OrderEvent>>,
}

impl DataLayer {
    pub fn new(config: Config, connector: Arc<dyn RemoteConnector>) -> Self {
        Self::with_store_factory(config, connector, Arc::new(DefaultStoreFactory::default()))
    }

    pub fn with_store_factory(
        config: Config,
        connector: Arc<dyn RemoteConnector>,
        factory: Arc<dyn StoreFactory>,
    ) -> Self {
        let config = Arc::new(config);
        let status = Arc::new(SyncStatusAggregator::new(config.sync_possible()));
        let orchestrator = Arc::new(SyncOrchestrator::new(status.clone()));
        let registry = Arc::new(DatabaseRegistry::new(
            config.clone(),
            factory,
            connector,
            orchestrator.clone(),
        ));
        Self {
            config,
            registry,
            orchestrator,
            status,
            tracker: Arc::new(TracingTracker),
            order_events: Arc::new(EventChannel::new("orders")),
        }
    }

    /// Replace the error tracker used by services created afterwards.
    pub fn with_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.tracker = tracker;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<DatabaseRegistry> {
        &self.registry
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn status(&self) -> &Arc<SyncStatusAggregator> {
        &self.status
    }

    pub async fn get_database(&self, entity: EntityType) -> Result<Arc<DatabaseHandle>> {
        self.registry.get_database(entity).await
    }

    pub async fn reset_database(&self, entity: EntityType) {
        self.registry.reset_database(entity).await
    }

    /// Destroy every local database. Irreversible.
    pub async fn clear_all_databases(&self) {
        self.registry.clear_all().await
    }

    pub fn get_sync_status(&self, entity: EntityType) -> SyncStatus {
        self.status.get_sync_status(entity)
    }

    /// Diagnostics for every database opened so far.
    pub async fn get_sync_statistics(&self) -> BTreeMap<String, SyncStatistics> {
        let mut stats = BTreeMap::new();
        for handle in self.registry.open_handles().await {
            let info = handle.info().await;
            let state = self.status.snapshot(handle.name());
            stats.insert(
                handle.name().to_string(),
                SyncStatistics {
                    local_doc_count: info.doc_count,
                    local_update_sequence: info.update_seq,
                    last_sync_timestamp: state.last_sync_at,
                    last_error: state.last_error.map(|e| e.message),
                },
            );
        }
        stats
    }

    /// Run a replication pass for `entity` now.
    pub async fn trigger_manual_sync(&self, entity: EntityType) -> Result<SyncReport> {
        if !self.status.sync_enabled_for(entity) {
            return Err(DataError::SyncDisabled(entity.to_string()));
        }
        self.registry.get_database(entity).await?;
        self.orchestrator.trigger_manual_sync(entity.db_name()).await
    }

    /// Restart replication after re-authentication.
    pub async fn resume_sync(&self, entity: EntityType) -> Result<()> {
        self.orchestrator.restart_sync(entity.db_name()).await
    }

    pub fn set_online(&self, online: bool) {
        self.status.set_online(online)
    }

    pub fn session_events(&self) -> &EventChannel<SessionEvent> {
        self.orchestrator.session_events()
    }

    pub fn order_events(&self) -> &EventChannel<OrderEvent> {
        &self.order_events
    }

    pub fn products(&self) -> ProductService {
        ProductService::new(self.registry.clone(), self.tracker.clone())
    }

    pub fn customers(&self) -> CustomerService {
        CustomerService::new(self.registry.clone(), self.tracker.clone())
    }

    pub fn operators(&self) -> OperatorService {
        OperatorService::new(self.registry.clone(), self.tracker.clone())
    }

    pub fn orders(&self) -> OrderService {
        OrderService::new(
            self.registry.clone(),
            self.tracker.clone(),
            self.order_events.clone(),
        )
    }

    /// Stop all replication tasks.
    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await
    }
}
