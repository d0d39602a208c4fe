//! Sync orchestrator.
//!
//! Owns the replication relationships, one per database, and routes their
//! events: status updates for every database, purging for confirmed order
//! pushes, and a single session invalidation per authorization failure
//! episode.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::entity::{EntityType, SyncMode};
use crate::error::{DataError, ReplicationError, Result};
use crate::events::{EventChannel, SessionEvent};
use crate::handle::DatabaseHandle;
use crate::purge::PurgePolicy;
use crate::replication::{
    Endpoint, Flow, Remote, Replication, ReplicationEvent, ReplicationObserver, SyncOptions,
};
use crate::status::{SyncPhase, SyncStatusAggregator};

/// Counts for a manual sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub purged: usize,
    pub denied: usize,
}

/// Replication options for an entity's database, or `None` if it never syncs.
pub fn options_for(entity: EntityType, config: &Config) -> Option<SyncOptions> {
    let base = SyncOptions {
        live: true,
        retry: true,
        batch_size: config.batch_size,
        retry_policy: config.retry.clone(),
        ..SyncOptions::default()
    };
    match entity.sync_mode() {
        SyncMode::Bidirectional => Some(base),
        SyncMode::PushOnly => Some(
            base.push_only()
                .with_filter(|doc| doc.str_field("status") == Some("completed")),
        ),
        SyncMode::LocalOnly => None,
    }
}

struct Relationship {
    handle: Arc<DatabaseHandle>,
    remote: Arc<dyn Remote>,
    options: SyncOptions,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// A relationship whose remote refused the connection. Kept so that
/// `restart_sync` can dial again after re-authentication.
struct Parked {
    handle: Arc<DatabaseHandle>,
    endpoint: Endpoint,
    options: SyncOptions,
    error: ReplicationError,
}

/// Routes replication events for one database.
struct EventRouter {
    handle: Arc<DatabaseHandle>,
    status: Arc<SyncStatusAggregator>,
    purge: PurgePolicy,
    sessions: Arc<EventChannel<SessionEvent>>,
    session_latch: Arc<AtomicBool>,
    purged: AtomicUsize,
}

#[async_trait]
impl ReplicationObserver for EventRouter {
    async fn on_event(&self, database: &str, event: ReplicationEvent) {
        match event {
            ReplicationEvent::Active => self.status.set_phase(database, SyncPhase::Active),
            ReplicationEvent::Paused => self.status.mark_synced(database, SyncPhase::Paused),
            ReplicationEvent::Complete(_) => self.status.mark_synced(database, SyncPhase::Complete),
            ReplicationEvent::Change { flow, docs } => match flow {
                Flow::Push => self.status.record_transfer(database, docs.len(), 0),
                Flow::Pull => self.status.record_transfer(database, 0, docs.len()),
            },
            ReplicationEvent::Confirmed { docs } => {
                if self.handle.entity() == EntityType::Orders {
                    let report = self.purge.apply(&self.handle, &docs).await;
                    self.purged.fetch_add(report.purged, Ordering::SeqCst);
                    self.status.record_purged(database, report.purged);
                }
            }
            ReplicationEvent::Denied { id, reason } => {
                tracing::warn!(database = %database, doc_id = %id, reason = %reason, "Document denied by remote");
                self.status.record_denied(database);
            }
            ReplicationEvent::Error(err) => {
                self.status.record_error(database, &err);
                if err.is_auth_failure() {
                    escalate(&self.sessions, &self.session_latch, database, err);
                }
            }
        }
    }
}

/// Publish a session invalidation unless one is already outstanding.
fn escalate(
    sessions: &EventChannel<SessionEvent>,
    latch: &AtomicBool,
    database: &str,
    error: ReplicationError,
) {
    if latch.swap(true, Ordering::SeqCst) {
        tracing::debug!(database = %database, "Session already invalidated");
        return;
    }
    tracing::error!(database = %database, error = %error, "Session invalidated");
    sessions.publish(&SessionEvent::Invalidated {
        database: database.to_string(),
        error,
    });
}

pub struct SyncOrchestrator {
    status: Arc<SyncStatusAggregator>,
    purge: PurgePolicy,
    sessions: Arc<EventChannel<SessionEvent>>,
    session_latch: Arc<AtomicBool>,
    relationships: DashMap<String, Relationship>,
    parked: DashMap<String, Parked>,
    manual_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SyncOrchestrator {
    pub fn new(status: Arc<SyncStatusAggregator>) -> Self {
        Self::with_purge_policy(status, PurgePolicy::default())
    }

    pub fn with_purge_policy(status: Arc<SyncStatusAggregator>, purge: PurgePolicy) -> Self {
        Self {
            status,
            purge,
            sessions: Arc::new(EventChannel::new("session")),
            session_latch: Arc::new(AtomicBool::new(false)),
            relationships: DashMap::new(),
            parked: DashMap::new(),
            manual_locks: DashMap::new(),
        }
    }

    pub fn session_events(&self) -> &EventChannel<SessionEvent> {
        &self.sessions
    }

    pub fn status(&self) -> &Arc<SyncStatusAggregator> {
        &self.status
    }

    fn router(&self, handle: &Arc<DatabaseHandle>) -> EventRouter {
        EventRouter {
            handle: handle.clone(),
            status: self.status.clone(),
            purge: self.purge.clone(),
            sessions: self.sessions.clone(),
            session_latch: self.session_latch.clone(),
            purged: AtomicUsize::new(0),
        }
    }

    /// Start continuous replication for `handle`, replacing any running one.
    pub async fn start_sync(
        &self,
        handle: Arc<DatabaseHandle>,
        remote: Arc<dyn Remote>,
        options: SyncOptions,
    ) {
        let name = handle.name();
        self.stop_sync(name).await;

        let cancel = CancellationToken::new();
        let router: Arc<dyn ReplicationObserver> = Arc::new(self.router(&handle));
        let task = Replication::new(handle.clone(), remote.clone(), options.clone())
            .spawn(router, cancel.clone());

        self.relationships.insert(
            name.to_string(),
            Relationship {
                handle,
                remote,
                options,
                cancel,
                task,
            },
        );
    }

    /// Connect through `endpoint` and start continuous replication. A
    /// refused connection is recorded and parked until [`restart_sync`].
    ///
    /// [`restart_sync`]: Self::restart_sync
    pub async fn connect(&self, handle: Arc<DatabaseHandle>, endpoint: Endpoint, options: SyncOptions) {
        let name = handle.name();
        match endpoint.connect().await {
            Ok(remote) => {
                self.parked.remove(name);
                self.start_sync(handle, remote, options).await;
            }
            Err(error) => {
                self.connect_failed(name, error.clone());
                self.parked.insert(
                    name.to_string(),
                    Parked {
                        handle,
                        endpoint,
                        options,
                        error,
                    },
                );
            }
        }
    }

    /// Cancel and await the relationship. Returns whether one existed,
    /// running or parked.
    pub async fn stop_sync(&self, database: &str) -> bool {
        let parked = self.parked.remove(database).is_some();
        let Some((_, relationship)) = self.relationships.remove(database) else {
            return parked;
        };
        relationship.cancel.cancel();
        if let Err(e) = relationship.task.await {
            tracing::warn!(database = %database, error = %e, "Replication task ended abnormally");
        }
        self.status.set_phase(database, SyncPhase::Stopped);
        tracing::info!(database = %database, "Sync stopped");
        true
    }

    /// Restart a relationship after re-authentication. A running or stopped
    /// relationship reuses its remote and options; a parked one connects
    /// again through its endpoint.
    pub async fn restart_sync(&self, database: &str) -> Result<()> {
        let existing = self
            .relationships
            .get(database)
            .map(|r| (r.handle.clone(), r.remote.clone(), r.options.clone()));

        if let Some((handle, remote, options)) = existing {
            self.session_latch.store(false, Ordering::SeqCst);
            self.start_sync(handle, remote, options).await;
            tracing::info!(database = %database, "Sync restarted");
            return Ok(());
        }

        let Some((_, parked)) = self.parked.remove(database) else {
            return Err(DataError::SyncDisabled(database.to_string()));
        };
        self.session_latch.store(false, Ordering::SeqCst);
        self.connect(parked.handle, parked.endpoint, parked.options)
            .await;
        if let Some(still) = self.parked.get(database) {
            return Err(DataError::Replication(still.error.clone()));
        }
        tracing::info!(database = %database, "Sync reconnected");
        Ok(())
    }

    pub fn is_running(&self, database: &str) -> bool {
        self.relationships
            .get(database)
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Whether a relationship is configured, running or not.
    pub fn has_relationship(&self, database: &str) -> bool {
        self.relationships.contains_key(database)
    }

    /// Whether the database waits for a reconnect after a refused connection.
    pub fn is_parked(&self, database: &str) -> bool {
        self.parked.contains_key(database)
    }

    fn connect_failed(&self, database: &str, error: ReplicationError) {
        tracing::warn!(database = %database, error = %error, "Could not connect to remote");
        self.status.record_error(database, &error);
        if error.is_auth_failure() {
            escalate(&self.sessions, &self.session_latch, database, error);
        }
    }

    /// Run one pass right now, in the relationship's direction and filter.
    ///
    /// Manual passes for the same database are serialized. They may overlap
    /// the continuous relationship; writes on both sides are idempotent by
    /// revision.
    pub async fn trigger_manual_sync(&self, database: &str) -> Result<SyncReport> {
        if let Some(parked) = self.parked.get(database) {
            return Err(DataError::Replication(parked.error.clone()));
        }
        let (handle, remote, options) = self
            .relationships
            .get(database)
            .map(|r| (r.handle.clone(), r.remote.clone(), r.options.one_shot()))
            .ok_or_else(|| DataError::SyncDisabled(database.to_string()))?;

        let lock = self
            .manual_locks
            .entry(database.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        tracing::info!(database = %database, "Manual sync started");
        let router = self.router(&handle);
        let pass = Replication::new(handle, remote, options)
            .run_once(&router)
            .await?;

        let report = SyncReport {
            pushed: pass.pushed,
            pulled: pass.pulled,
            purged: router.purged.load(Ordering::SeqCst),
            denied: pass.denied,
        };
        tracing::info!(database = %database, report = ?report, "Manual sync finished");
        Ok(report)
    }

    /// Stop every relationship.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.relationships.iter().map(|r| r.key().clone()).collect();
        for name in names {
            self.stop_sync(&name).await;
        }
        self.parked.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplicationErrorKind;
    use crate::replication::MemoryRemote;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use till_engine::{Adapter, Document, DocumentStore, StoreOptions};

    fn handle(entity: EntityType) -> Arc<DatabaseHandle> {
        let store = DocumentStore::open(entity.db_name(), StoreOptions::new(Adapter::Memory)).unwrap();
        Arc::new(DatabaseHandle::new(entity, store))
    }

    async fn eventually<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[test]
    fn options_per_entity() {
        let config = Config::default();
        let products = options_for(EntityType::Products, &config).unwrap();
        assert!(products.live && products.retry);
        assert!(products.filter.is_none());

        let orders = options_for(EntityType::Orders, &config).unwrap();
        let filter = orders.filter.clone().unwrap();
        assert!(filter(&Document::new("o", json!({"status": "completed"}))));
        assert!(!filter(&Document::new("o", json!({"status": "pending"}))));
        assert!(!filter(&Document::new("o", json!({"status": "cancelled"}))));

        assert!(options_for(EntityType::Preferences, &config).is_none());
    }

    #[tokio::test]
    async fn start_and_stop() {
        let orchestrator = SyncOrchestrator::new(Arc::new(SyncStatusAggregator::new(true)));
        let products = handle(EntityType::Products);
        let remote = Arc::new(MemoryRemote::new("memory://till/products").unwrap());

        orchestrator
            .start_sync(products.clone(), remote, SyncOptions::default())
            .await;
        assert!(orchestrator.is_running("products"));

        assert!(orchestrator.stop_sync("products").await);
        assert!(!orchestrator.is_running("products"));
        assert!(!orchestrator.stop_sync("products").await);
        assert_eq!(orchestrator.status().snapshot("products").phase, SyncPhase::Stopped);
    }

    #[tokio::test]
    async fn auth_failure_invalidates_session_once() {
        let orchestrator = SyncOrchestrator::new(Arc::new(SyncStatusAggregator::new(true)));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _sub = orchestrator.session_events().subscribe(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for entity in [EntityType::Products, EntityType::Customers] {
            let remote = Arc::new(MemoryRemote::new(format!("memory://till/{entity}")).unwrap());
            remote.revoke(ReplicationErrorKind::Unauthorized);
            orchestrator
                .start_sync(handle(entity), remote, SyncOptions::default())
                .await;
        }

        let o = &orchestrator;
        assert!(eventually(move || async move { !o.is_running("products") && !o.is_running("customers") }).await);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(orchestrator.status().snapshot("products").phase, SyncPhase::Errored);
    }

    #[tokio::test]
    async fn restart_after_reauthentication() {
        let orchestrator = SyncOrchestrator::new(Arc::new(SyncStatusAggregator::new(true)));
        let products = handle(EntityType::Products);
        let remote = Arc::new(MemoryRemote::new("memory://till/products").unwrap());
        remote.revoke(ReplicationErrorKind::Forbidden);
        products
            .put(Document::new("p-1", json!({"name": "Cola"})))
            .await
            .unwrap();

        orchestrator
            .start_sync(products, remote.clone(), SyncOptions::default())
            .await;
        let o = &orchestrator;
        assert!(eventually(move || async move { !o.is_running("products") }).await);
        assert!(orchestrator.has_relationship("products"));

        remote.restore();
        orchestrator.restart_sync("products").await.unwrap();
        let r = &remote;
        assert!(eventually(move || async move { r.doc_count().await == 1 }).await);
        orchestrator.shutdown().await;
    }

    /// Holds the first push until released, so local writes can land mid-push.
    struct GatedRemote {
        inner: MemoryRemote,
        gated: AtomicBool,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl GatedRemote {
        fn new(url: &str) -> Self {
            Self {
                inner: MemoryRemote::new(url).unwrap(),
                gated: AtomicBool::new(true),
                entered: tokio::sync::Notify::new(),
                release: tokio::sync::Notify::new(),
            }
        }
    }

    #[async_trait]
    impl Remote for GatedRemote {
        fn url(&self) -> &str {
            self.inner.url()
        }

        async fn push(&self, docs: Vec<Document>) -> std::result::Result<crate::replication::PushResponse, ReplicationError> {
            if self.gated.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.push(docs).await
        }

        async fn pull(&self, since: till_engine::Seq, limit: usize) -> std::result::Result<till_engine::ChangesBatch, ReplicationError> {
            self.inner.pull(since, limit).await
        }

        fn subscribe(&self) -> tokio::sync::watch::Receiver<till_engine::Seq> {
            self.inner.subscribe()
        }
    }

    #[tokio::test]
    async fn local_edit_during_push_is_not_purged() {
        let orchestrator = SyncOrchestrator::new(Arc::new(SyncStatusAggregator::new(true)));
        let orders = handle(EntityType::Orders);
        let first = orders
            .put(Document::new("o-1", json!({"status": "completed", "total": 1.0})))
            .await
            .unwrap();
        let remote = Arc::new(GatedRemote::new("memory://till/orders"));

        let router = orchestrator.router(&orders);
        let options = options_for(EntityType::Orders, &Config::default()).unwrap().one_shot();
        let mut replication = Replication::new(orders.clone(), remote.clone(), options);
        let pass = tokio::spawn(async move {
            replication.run_pass(&router).await.unwrap();
            router.purged.load(Ordering::SeqCst)
        });

        remote.entered.notified().await;
        let second = orders
            .put(
                Document::new("o-1", json!({"status": "completed", "total": 2.0, "note": "fixed"}))
                    .with_rev(first.rev.clone()),
            )
            .await
            .unwrap();
        remote.release.notify_one();
        pass.await.unwrap();

        // The rewrite reached the remote before anything left the device.
        let remote_doc = remote.inner.get("o-1").await.unwrap();
        assert_eq!(remote_doc.rev, Some(second.rev));
        assert_eq!(remote_doc.body["total"], json!(2.0));
    }

    #[tokio::test]
    async fn refused_connection_is_parked_until_restart() {
        use crate::config::Credentials;
        use crate::replication::MemoryServer;

        let orchestrator = SyncOrchestrator::new(Arc::new(SyncStatusAggregator::new(true)));
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let _sub = orchestrator.session_events().subscribe(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let ours = Credentials {
            username: "till".into(),
            password: "rotated".into(),
        };
        let server = Arc::new(MemoryServer::new().with_credentials(Credentials {
            username: "till".into(),
            password: "current".into(),
        }));
        let products = handle(EntityType::Products);
        products
            .put(Document::new("p-1", json!({"name": "Cola"})))
            .await
            .unwrap();
        let endpoint = Endpoint {
            connector: server.clone(),
            url: "memory://till/products".into(),
            credentials: Some(ours.clone()),
        };

        orchestrator
            .connect(products, endpoint, SyncOptions::default())
            .await;
        assert!(orchestrator.is_parked("products"));
        assert!(!orchestrator.has_relationship("products"));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(
            orchestrator.trigger_manual_sync("products").await,
            Err(DataError::Replication(ref e)) if e.is_auth_failure()
        ));

        // Still refused: stays parked and signals again.
        assert!(orchestrator.restart_sync("products").await.is_err());
        assert!(orchestrator.is_parked("products"));
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        server.require_credentials(Some(ours));
        orchestrator.restart_sync("products").await.unwrap();
        assert!(!orchestrator.is_parked("products"));
        assert!(orchestrator.is_running("products"));

        let remote = server.collection("memory://till/products").unwrap();
        let r = &remote;
        assert!(eventually(move || async move { r.doc_count().await == 1 }).await);
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn manual_sync_without_relationship_is_disabled() {
        let orchestrator = SyncOrchestrator::new(Arc::new(SyncStatusAggregator::new(false)));
        let err = orchestrator.trigger_manual_sync("orders").await.unwrap_err();
        assert!(matches!(err, DataError::SyncDisabled(_)));
    }
}
