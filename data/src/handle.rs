//! Database handles.
//!
//! A handle owns the local store for one entity type. Store access is
//! serialized by an async `RwLock`; every write that moves the update
//! sequence is announced on a `watch` channel, which is what continuous
//! replication waits on.

use async_trait::async_trait;
use till_engine::{
    Adapter, ChangesBatch, Document, DocumentStore, IndexCreation, IndexSpec, ReplicatedWrite,
    Revision, Selector, Seq, StoreInfo, WriteResult,
};
use tokio::sync::{watch, RwLock};

use crate::entity::EntityType;
use crate::error::Result;
use crate::indexes::IndexTarget;

pub struct DatabaseHandle {
    entity: EntityType,
    adapter: Adapter,
    store: RwLock<DocumentStore>,
    seq_tx: watch::Sender<Seq>,
}

impl std::fmt::Debug for DatabaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseHandle")
            .field("name", &self.name())
            .field("adapter", &self.adapter)
            .finish()
    }
}

impl DatabaseHandle {
    pub fn new(entity: EntityType, store: DocumentStore) -> Self {
        let adapter = store.adapter();
        let seq = store.update_seq();
        Self {
            entity,
            adapter,
            store: RwLock::new(store),
            seq_tx: watch::channel(seq).0,
        }
    }

    pub fn entity(&self) -> EntityType {
        self.entity
    }

    pub fn name(&self) -> &'static str {
        self.entity.db_name()
    }

    pub fn adapter(&self) -> Adapter {
        self.adapter
    }

    /// Watch the local update sequence.
    pub fn subscribe(&self) -> watch::Receiver<Seq> {
        self.seq_tx.subscribe()
    }

    fn announce(&self, seq: Seq) {
        self.seq_tx.send_if_modified(|current| {
            if *current == seq {
                return false;
            }
            *current = seq;
            true
        });
    }

    pub async fn info(&self) -> StoreInfo {
        self.store.read().await.info()
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        Ok(self.store.read().await.get(id)?.clone())
    }

    /// Losing revisions kept after a replication conflict.
    pub async fn conflicts(&self, id: &str) -> Result<Vec<Revision>> {
        Ok(self.store.read().await.conflicts(id)?)
    }

    pub async fn discard_conflict(&self, id: &str, rev: &Revision) -> Result<()> {
        Ok(self.store.write().await.discard_conflict(id, rev)?)
    }

    pub async fn put(&self, doc: Document) -> Result<WriteResult> {
        let mut store = self.store.write().await;
        let written = store.put(doc)?;
        self.announce(store.update_seq());
        Ok(written)
    }

    pub async fn remove(&self, id: &str, rev: &Revision) -> Result<WriteResult> {
        let mut store = self.store.write().await;
        let removed = store.remove(id, rev)?;
        self.announce(store.update_seq());
        Ok(removed)
    }

    /// Write several documents under one lock; results are per document.
    pub async fn bulk_docs(&self, docs: Vec<Document>) -> Vec<Result<WriteResult>> {
        let mut store = self.store.write().await;
        let results = store
            .bulk_docs(docs)
            .into_iter()
            .map(|r| r.map_err(Into::into))
            .collect();
        self.announce(store.update_seq());
        results
    }

    pub async fn all_docs(&self) -> Result<Vec<Document>> {
        let store = self.store.read().await;
        Ok(store.all_docs()?.into_iter().cloned().collect())
    }

    pub async fn find(&self, selector: &Selector) -> Result<Vec<Document>> {
        let store = self.store.read().await;
        Ok(store.find(selector)?.into_iter().cloned().collect())
    }

    pub async fn changes_since(&self, since: Seq, limit: usize) -> Result<ChangesBatch> {
        Ok(self.store.read().await.changes_since(since, limit)?)
    }

    pub async fn apply_replicated(&self, doc: Document) -> Result<ReplicatedWrite> {
        let mut store = self.store.write().await;
        let outcome = store.apply_replicated(doc)?;
        self.announce(store.update_seq());
        Ok(outcome)
    }

    /// Remove a document with its history. Purges are local only and are
    /// not announced to replication.
    pub async fn purge(&self, id: &str) -> Result<Vec<Revision>> {
        Ok(self.store.write().await.purge(id)?)
    }

    /// Purge `id` only if `rev` is still current, checked under the write lock.
    pub async fn purge_revision(&self, id: &str, rev: &Revision) -> Result<Vec<Revision>> {
        Ok(self.store.write().await.purge_revision(id, rev)?)
    }

    pub async fn create_index(&self, spec: IndexSpec) -> Result<IndexCreation> {
        Ok(self.store.write().await.create_index(spec)?)
    }

    pub async fn destroy(&self) {
        self.store.write().await.destroy();
        tracing::info!(database = %self.name(), "Local store destroyed");
    }

    pub async fn is_destroyed(&self) -> bool {
        self.store.read().await.is_destroyed()
    }
}

#[async_trait]
impl IndexTarget for DatabaseHandle {
    fn name(&self) -> &str {
        self.entity.db_name()
    }

    async fn create_index(&self, spec: IndexSpec) -> Result<IndexCreation> {
        DatabaseHandle::create_index(self, spec).await
    }
}
