//! Database registry.
//!
//! One handle per entity type, built lazily. Each entity has its own slot
//! behind an async mutex, so concurrent first calls wait for the one
//! construction in flight instead of racing to build a second handle.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use till_engine::{Adapter, DocumentStore, StoreOptions};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::entity::EntityType;
use crate::error::Result;
use crate::handle::DatabaseHandle;
use crate::indexes::IndexManager;
use crate::orchestrator::{options_for, SyncOrchestrator};
use crate::replication::{Endpoint, RemoteConnector};

/// Opens the local store for an entity.
#[async_trait]
pub trait StoreFactory: Send + Sync {
    async fn open(&self, entity: EntityType, adapter: Adapter) -> Result<DocumentStore>;
}

/// Opens in-process stores, optionally bounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStoreFactory {
    pub max_docs: Option<usize>,
}

#[async_trait]
impl StoreFactory for DefaultStoreFactory {
    async fn open(&self, entity: EntityType, adapter: Adapter) -> Result<DocumentStore> {
        let mut options = StoreOptions::new(adapter);
        options.max_docs = self.max_docs;
        Ok(DocumentStore::open(entity.db_name(), options)?)
    }
}

type Slot = Arc<Mutex<Option<Arc<DatabaseHandle>>>>;

pub struct DatabaseRegistry {
    config: Arc<Config>,
    factory: Arc<dyn StoreFactory>,
    connector: Arc<dyn RemoteConnector>,
    orchestrator: Arc<SyncOrchestrator>,
    indexes: IndexManager,
    slots: DashMap<EntityType, Slot>,
}

impl DatabaseRegistry {
    pub fn new(
        config: Arc<Config>,
        factory: Arc<dyn StoreFactory>,
        connector: Arc<dyn RemoteConnector>,
        orchestrator: Arc<SyncOrchestrator>,
    ) -> Self {
        Self {
            config,
            factory,
            connector,
            orchestrator,
            indexes: IndexManager::new(),
            slots: DashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    fn slot(&self, entity: EntityType) -> Slot {
        self.slots.entry(entity).or_default().clone()
    }

    /// The handle for `entity`, constructing it on first use.
    ///
    /// Construction errors propagate and leave the slot empty.
    pub async fn get_database(&self, entity: EntityType) -> Result<Arc<DatabaseHandle>> {
        let slot = self.slot(entity);
        let mut guard = slot.lock().await;
        if let Some(handle) = guard.as_ref() {
            return Ok(handle.clone());
        }

        let store = self.factory.open(entity, self.config.adapter).await?;
        let handle = Arc::new(DatabaseHandle::new(entity, store));
        self.indexes
            .ensure_all(handle.as_ref(), entity.index_specs())
            .await?;
        tracing::info!(database = %entity, adapter = %self.config.adapter, "Database opened");

        if self.config.sync_possible() {
            self.start_replication(&handle).await;
        }

        *guard = Some(handle.clone());
        Ok(handle)
    }

    async fn start_replication(&self, handle: &Arc<DatabaseHandle>) {
        let entity = handle.entity();
        let (Some(options), Some(url)) = (
            options_for(entity, &self.config),
            self.config.remote_collection_url(entity.db_name()),
        ) else {
            return;
        };

        let endpoint = Endpoint {
            connector: self.connector.clone(),
            url,
            credentials: self.config.credentials.clone(),
        };
        self.orchestrator
            .connect(handle.clone(), endpoint, options)
            .await;
    }

    /// Stop replication, destroy the store and clear the slot.
    pub async fn reset_database(&self, entity: EntityType) {
        let slot = self.slot(entity);
        let mut guard = slot.lock().await;
        self.orchestrator.stop_sync(entity.db_name()).await;
        if let Some(handle) = guard.take() {
            handle.destroy().await;
        }
        self.indexes.forget(entity.db_name());
        tracing::info!(database = %entity, "Database reset");
    }

    /// Reset every entity type.
    pub async fn clear_all(&self) {
        for entity in EntityType::ALL {
            self.reset_database(entity).await;
        }
        tracing::warn!("All local databases cleared");
    }

    /// Handles constructed so far.
    pub async fn open_handles(&self) -> Vec<Arc<DatabaseHandle>> {
        let slots: Vec<Slot> = self.slots.iter().map(|s| s.value().clone()).collect();
        let mut handles = Vec::new();
        for slot in slots {
            if let Some(handle) = slot.lock().await.as_ref() {
                handles.push(handle.clone());
            }
        }
        handles.sort_by_key(|h| h.entity());
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use crate::replication::MemoryServer;
    use crate::status::SyncStatusAggregator;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use till_engine::Document;

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
    }

    #[async_trait]
    impl StoreFactory for CountingFactory {
        async fn open(&self, entity: EntityType, adapter: Adapter) -> Result<DocumentStore> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            DefaultStoreFactory::default().open(entity, adapter).await
        }
    }

    struct FailingFactory;

    #[async_trait]
    impl StoreFactory for FailingFactory {
        async fn open(&self, _entity: EntityType, _adapter: Adapter) -> Result<DocumentStore> {
            Err(DataError::Storage("quota exceeded".into()))
        }
    }

    fn registry(factory: Arc<dyn StoreFactory>) -> DatabaseRegistry {
        let config = Config {
            adapter: Adapter::Memory,
            ..Config::default()
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(Arc::new(SyncStatusAggregator::new(false))));
        DatabaseRegistry::new(Arc::new(config), factory, MemoryServer::new_shared(), orchestrator)
    }

    #[tokio::test]
    async fn same_handle_until_reset() {
        let registry = registry(Arc::new(DefaultStoreFactory::default()));
        let first = registry.get_database(EntityType::Products).await.unwrap();
        let second = registry.get_database(EntityType::Products).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.reset_database(EntityType::Products).await;
        let third = registry.get_database(EntityType::Products).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert!(first.is_destroyed().await);
    }

    #[tokio::test]
    async fn indexes_are_created_on_open() {
        let registry = registry(Arc::new(DefaultStoreFactory::default()));
        let orders = registry.get_database(EntityType::Orders).await.unwrap();
        orders
            .put(Document::new("o-1", json!({"status": "pending"})))
            .await
            .unwrap();
        let found = orders
            .find(&till_engine::Selector::new().eq("status", "pending"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_first_calls_build_once() {
        let factory = Arc::new(CountingFactory::default());
        let registry = Arc::new(registry(factory.clone()));

        let calls = (0..8).map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.get_database(EntityType::Customers).await })
        });
        let handles: Vec<_> = futures::future::join_all(calls)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();

        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[tokio::test]
    async fn construction_failure_propagates() {
        let registry = registry(Arc::new(FailingFactory));
        let err = registry.get_database(EntityType::Orders).await.unwrap_err();
        assert!(matches!(err, DataError::Storage(_)));
        assert!(registry.open_handles().await.is_empty());
    }
}
