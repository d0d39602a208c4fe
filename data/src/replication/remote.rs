//! Remote collections.
//!
//! The data layer does not define a wire protocol. A [`Remote`] is whatever
//! can accept replicated revisions and serve a change feed; a
//! [`RemoteConnector`] resolves a collection URL plus credentials into one.
//! [`MemoryServer`] is the in-process implementation used by `tillctl` and
//! the test suite, with failure injection for transient and authorization
//! errors.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use till_engine::{
    Adapter, ChangesBatch, DocId, Document, DocumentStore, Error as EngineError, ReplicatedWrite,
    Seq, StoreOptions,
};
use tokio::sync::{watch, RwLock};

use crate::config::Credentials;
use crate::error::{ReplicationError, ReplicationErrorKind};

/// A document the remote refused to store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeniedDoc {
    pub id: DocId,
    pub reason: String,
}

/// Result of pushing a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    /// Revisions the remote stored
    pub written: Vec<DocId>,
    /// Revisions the remote already had
    pub already_known: Vec<DocId>,
    /// Revisions rejected individually
    pub denied: Vec<DeniedDoc>,
}

impl PushResponse {
    /// Whether the remote holds the document after this push.
    pub fn confirms(&self, id: &str) -> bool {
        self.written.iter().chain(&self.already_known).any(|w| w == id)
    }
}

/// One remote collection.
#[async_trait]
pub trait Remote: Send + Sync {
    fn url(&self) -> &str;

    /// Store replicated revisions; each document is accepted or denied on its own.
    async fn push(&self, docs: Vec<Document>) -> Result<PushResponse, ReplicationError>;

    /// Remote change feed after `since`.
    async fn pull(&self, since: Seq, limit: usize) -> Result<ChangesBatch, ReplicationError>;

    /// Watch the remote update sequence.
    fn subscribe(&self) -> watch::Receiver<Seq>;
}

/// Resolves collection URLs into remotes.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Remote>, ReplicationError>;
}

/// Where a relationship's remote lives, kept so it can be dialled again.
#[derive(Clone)]
pub struct Endpoint {
    pub connector: Arc<dyn RemoteConnector>,
    pub url: String,
    pub credentials: Option<Credentials>,
}

impl Endpoint {
    pub async fn connect(&self) -> Result<Arc<dyn Remote>, ReplicationError> {
        self.connector
            .connect(&self.url, self.credentials.as_ref())
            .await
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

type DenyRule = Arc<dyn Fn(&Document) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct Faults {
    transient: VecDeque<String>,
    revoked: Option<ReplicationErrorKind>,
    deny: Option<DenyRule>,
}

/// In-process remote collection backed by a [`DocumentStore`].
pub struct MemoryRemote {
    url: String,
    store: RwLock<DocumentStore>,
    seq_tx: watch::Sender<Seq>,
    faults: Mutex<Faults>,
}

impl MemoryRemote {
    pub fn new(url: impl Into<String>) -> Result<Self, EngineError> {
        let url = url.into();
        // Remote collections are named like local ones; fall back when the
        // URL tail is not a valid store name.
        let name = url
            .rsplit('/')
            .next()
            .filter(|n| n.chars().next().is_some_and(|c| c.is_ascii_lowercase()))
            .unwrap_or("remote")
            .to_string();
        let store = DocumentStore::open(name, StoreOptions::new(Adapter::Memory))?;
        Ok(Self {
            url,
            store: RwLock::new(store),
            seq_tx: watch::channel(0).0,
            faults: Mutex::new(Faults::default()),
        })
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` calls with a transient error.
    pub fn fail_next(&self, count: usize) {
        let mut faults = self.faults();
        for i in 0..count {
            faults
                .transient
                .push_back(format!("connection reset (injected {})", i + 1));
        }
    }

    /// Reject every call with an authorization error until [`restore`](Self::restore).
    pub fn revoke(&self, kind: ReplicationErrorKind) {
        self.faults().revoked = Some(kind);
    }

    pub fn restore(&self) {
        self.faults().revoked = None;
    }

    /// Deny pushed documents for which `rule` returns a reason.
    pub fn deny_when<F>(&self, rule: F)
    where
        F: Fn(&Document) -> Option<String> + Send + Sync + 'static,
    {
        self.faults().deny = Some(Arc::new(rule));
    }

    fn check(&self) -> Result<(), ReplicationError> {
        let mut faults = self.faults();
        match faults.revoked {
            Some(ReplicationErrorKind::Forbidden) => {
                return Err(ReplicationError::forbidden(format!("403 on {}", self.url)))
            }
            Some(_) => return Err(ReplicationError::unauthorized(format!("401 on {}", self.url))),
            None => {}
        }
        match faults.transient.pop_front() {
            Some(message) => Err(ReplicationError::transient(message)),
            None => Ok(()),
        }
    }

    fn publish(&self, seq: Seq) {
        self.seq_tx.send_if_modified(|current| {
            if *current == seq {
                return false;
            }
            *current = seq;
            true
        });
    }

    /// Write directly on the remote, as another device would.
    pub async fn put(&self, doc: Document) -> Result<Document, EngineError> {
        let mut store = self.store.write().await;
        let written = store.put(doc)?;
        let stored = store.get(&written.id)?.clone();
        self.publish(store.update_seq());
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> Option<Document> {
        self.store.read().await.get(id).ok().cloned()
    }

    pub async fn doc_count(&self) -> usize {
        self.store.read().await.doc_count()
    }

    pub async fn doc_ids(&self) -> Vec<DocId> {
        let store = self.store.read().await;
        store
            .all_docs()
            .map(|docs| docs.into_iter().map(|d| d.id.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Remote for MemoryRemote {
    fn url(&self) -> &str {
        &self.url
    }

    async fn push(&self, docs: Vec<Document>) -> Result<PushResponse, ReplicationError> {
        self.check()?;
        let deny = self.faults().deny.clone();

        let mut response = PushResponse::default();
        let mut store = self.store.write().await;
        for doc in docs {
            if let Some(reason) = deny.as_ref().and_then(|rule| rule(&doc)) {
                response.denied.push(DeniedDoc { id: doc.id, reason });
                continue;
            }
            let id = doc.id.clone();
            match store.apply_replicated(doc) {
                Ok(ReplicatedWrite::AlreadyKnown) => response.already_known.push(id),
                Ok(_) => response.written.push(id),
                Err(e) => response.denied.push(DeniedDoc {
                    id,
                    reason: e.to_string(),
                }),
            }
        }
        self.publish(store.update_seq());
        Ok(response)
    }

    async fn pull(&self, since: Seq, limit: usize) -> Result<ChangesBatch, ReplicationError> {
        self.check()?;
        self.store
            .read()
            .await
            .changes_since(since, limit)
            .map_err(|e| ReplicationError::transient(e.to_string()))
    }

    fn subscribe(&self) -> watch::Receiver<Seq> {
        self.seq_tx.subscribe()
    }
}

/// In-process server holding one [`MemoryRemote`] per collection URL.
#[derive(Default)]
pub struct MemoryServer {
    credentials: Mutex<Option<Credentials>>,
    collections: DashMap<String, Arc<MemoryRemote>>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require these credentials on connect.
    pub fn with_credentials(self, credentials: Credentials) -> Self {
        self.require_credentials(Some(credentials));
        self
    }

    /// Change the accepted credentials, e.g. after a password rotation.
    pub fn require_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.lock().unwrap_or_else(PoisonError::into_inner) = credentials;
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Collection at `url`, created empty on first use.
    pub fn collection(&self, url: &str) -> Result<Arc<MemoryRemote>, EngineError> {
        if let Some(existing) = self.collections.get(url) {
            return Ok(existing.clone());
        }
        let remote = Arc::new(MemoryRemote::new(url)?);
        Ok(self
            .collections
            .entry(url.to_string())
            .or_insert(remote)
            .clone())
    }
}

#[async_trait]
impl RemoteConnector for MemoryServer {
    async fn connect(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn Remote>, ReplicationError> {
        let required = self
            .credentials
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(required) = required {
            if credentials != Some(&required) {
                return Err(ReplicationError::unauthorized(format!(
                    "credentials rejected for {url}"
                )));
            }
        }
        let remote: Arc<dyn Remote> = self
            .collection(url)
            .map_err(|e| ReplicationError::transient(e.to_string()))?;
        tracing::debug!(url = %url, "Connected to in-process remote");
        Ok(remote)
    }
}
