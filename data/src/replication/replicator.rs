//! Replication between a local handle and a remote collection.
//!
//! A [`Replication`] keeps its own checkpoints. One pass pulls the remote
//! feed (bidirectional only) and then pushes the local feed through the
//! optional filter. Continuous replication runs passes in a tokio task,
//! waking on local or remote sequence changes, backing off on transient
//! failures and stopping for good on authorization failures.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use till_engine::{Document, Seq};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::remote::Remote;
use super::RetryPolicy;
use crate::error::{DataError, ReplicationError};
use crate::handle::DatabaseHandle;

/// Predicate selecting which local documents are pushed.
pub type DocFilter = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Bidirectional,
    PushOnly,
}

/// Which way a batch travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Flow {
    Push,
    Pull,
}

/// How a replication runs.
#[derive(Clone)]
pub struct SyncOptions {
    /// Keep running and follow changes, instead of a single pass
    pub live: bool,
    /// Retry transient failures
    pub retry: bool,
    pub direction: Direction,
    /// Only documents matching are pushed
    pub filter: Option<DocFilter>,
    pub batch_size: usize,
    pub retry_policy: RetryPolicy,
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("live", &self.live)
            .field("retry", &self.retry)
            .field("direction", &self.direction)
            .field("filtered", &self.filter.is_some())
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            live: true,
            retry: true,
            direction: Direction::Bidirectional,
            filter: None,
            batch_size: 100,
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl SyncOptions {
    pub fn push_only(mut self) -> Self {
        self.direction = Direction::PushOnly;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Same relationship, single pass.
    pub fn one_shot(&self) -> Self {
        Self {
            live: false,
            ..self.clone()
        }
    }

    fn admits(&self, doc: &Document) -> bool {
        self.filter.as_ref().map_or(true, |f| f(doc))
    }
}

/// Lifecycle signals of a replication.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// Data is flowing
    Active,
    /// Up to date, waiting for changes
    Paused,
    /// A batch was transferred; for pushes, only documents the remote newly stored
    Change { flow: Flow, docs: Vec<Document> },
    /// Pushed documents the remote holds after the push, echoes included
    Confirmed { docs: Vec<Document> },
    /// The remote rejected one document
    Denied { id: String, reason: String },
    /// Connection-level failure
    Error(ReplicationError),
    /// One-shot pass finished
    Complete(PassReport),
}

/// Receives replication events in order.
#[async_trait]
pub trait ReplicationObserver: Send + Sync {
    async fn on_event(&self, database: &str, event: ReplicationEvent);
}

/// Counts for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub pushed: usize,
    pub pulled: usize,
    pub denied: usize,
}

impl PassReport {
    pub fn is_empty(&self) -> bool {
        self.pushed == 0 && self.pulled == 0 && self.denied == 0
    }
}

#[derive(Debug)]
enum PassError {
    Remote(ReplicationError),
    Local(DataError),
}

impl From<ReplicationError> for PassError {
    fn from(err: ReplicationError) -> Self {
        PassError::Remote(err)
    }
}

impl From<DataError> for PassError {
    fn from(err: DataError) -> Self {
        PassError::Local(err)
    }
}

impl PassError {
    fn into_replication_error(self) -> ReplicationError {
        match self {
            PassError::Remote(e) => e,
            // A destroyed or failing local store reads like an unavailable peer.
            PassError::Local(e) => ReplicationError::transient(e.to_string()),
        }
    }
}

/// One replication relationship.
pub struct Replication {
    handle: Arc<DatabaseHandle>,
    remote: Arc<dyn Remote>,
    options: SyncOptions,
    push_checkpoint: Seq,
    pull_checkpoint: Seq,
}

impl Replication {
    pub fn new(handle: Arc<DatabaseHandle>, remote: Arc<dyn Remote>, options: SyncOptions) -> Self {
        Self {
            handle,
            remote,
            options,
            push_checkpoint: 0,
            pull_checkpoint: 0,
        }
    }

    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    async fn pull_all(&mut self, observer: &dyn ReplicationObserver) -> Result<usize, PassError> {
        let name = self.handle.name();
        let mut pulled = 0;
        loop {
            let batch = self
                .remote
                .pull(self.pull_checkpoint, self.options.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(pulled);
            }

            let mut applied = Vec::with_capacity(batch.results.len());
            for change in batch.results {
                let outcome = self.handle.apply_replicated(change.doc.clone()).await?;
                if outcome != till_engine::ReplicatedWrite::AlreadyKnown {
                    applied.push(change.doc);
                }
            }
            self.pull_checkpoint = batch.last_seq;

            if !applied.is_empty() {
                tracing::debug!(database = %name, count = applied.len(), "Pulled batch");
                pulled += applied.len();
                observer
                    .on_event(name, ReplicationEvent::Change { flow: Flow::Pull, docs: applied })
                    .await;
            }
        }
    }

    async fn push_all(
        &mut self,
        observer: &dyn ReplicationObserver,
        report: &mut PassReport,
    ) -> Result<(), PassError> {
        let name = self.handle.name();
        loop {
            let batch = self
                .handle
                .changes_since(self.push_checkpoint, self.options.batch_size)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            let outgoing: Vec<Document> = batch
                .results
                .into_iter()
                .map(|c| c.doc)
                .filter(|d| self.options.admits(d))
                .collect();

            if !outgoing.is_empty() {
                let response = self.remote.push(outgoing.clone()).await?;
                for denied in response.denied.iter().cloned() {
                    report.denied += 1;
                    observer
                        .on_event(
                            name,
                            ReplicationEvent::Denied {
                                id: denied.id,
                                reason: denied.reason,
                            },
                        )
                        .await;
                }

                let confirmed: Vec<Document> = outgoing
                    .into_iter()
                    .filter(|d| response.confirms(&d.id))
                    .collect();
                let written: Vec<Document> = confirmed
                    .iter()
                    .filter(|d| response.written.contains(&d.id))
                    .cloned()
                    .collect();
                report.pushed += written.len();
                if !written.is_empty() {
                    tracing::debug!(database = %name, count = written.len(), "Pushed batch");
                    observer
                        .on_event(name, ReplicationEvent::Change { flow: Flow::Push, docs: written })
                        .await;
                }
                if !confirmed.is_empty() {
                    observer
                        .on_event(name, ReplicationEvent::Confirmed { docs: confirmed })
                        .await;
                }
            }
            // Filtered documents are skipped for good; a later write gives
            // them a new sequence.
            self.push_checkpoint = batch.last_seq;
        }
    }

    /// Run one pass: pull (bidirectional only), then push.
    pub async fn run_pass(
        &mut self,
        observer: &dyn ReplicationObserver,
    ) -> Result<PassReport, ReplicationError> {
        let mut report = PassReport::default();
        if self.options.direction == Direction::Bidirectional {
            report.pulled = self
                .pull_all(observer)
                .await
                .map_err(PassError::into_replication_error)?;
        }
        self.push_all(observer, &mut report)
            .await
            .map_err(PassError::into_replication_error)?;
        Ok(report)
    }

    /// Single pass with `active` ... `complete` or `error` events.
    pub async fn run_once(
        &mut self,
        observer: &dyn ReplicationObserver,
    ) -> Result<PassReport, ReplicationError> {
        let name = self.handle.name();
        observer.on_event(name, ReplicationEvent::Active).await;
        match self.run_pass(observer).await {
            Ok(report) => {
                observer.on_event(name, ReplicationEvent::Complete(report)).await;
                Ok(report)
            }
            Err(err) => {
                observer.on_event(name, ReplicationEvent::Error(err.clone())).await;
                Err(err)
            }
        }
    }

    /// Run until cancelled, or until an authorization failure.
    pub fn spawn(
        mut self,
        observer: Arc<dyn ReplicationObserver>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.handle.name();
            let pulls = self.options.direction == Direction::Bidirectional;
            let mut local = self.handle.subscribe();
            let mut remote = self.remote.subscribe();
            let mut failures: u32 = 0;

            tracing::info!(database = %name, url = %self.remote.url(), options = ?self.options, "Replication started");

            loop {
                local.borrow_and_update();
                remote.borrow_and_update();

                observer.on_event(name, ReplicationEvent::Active).await;
                match self.run_pass(observer.as_ref()).await {
                    Ok(report) => {
                        failures = 0;
                        observer.on_event(name, ReplicationEvent::Paused).await;
                        if !self.options.live {
                            observer.on_event(name, ReplicationEvent::Complete(report)).await;
                            break;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            changed = local.changed() => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                            changed = remote.changed(), if pulls => {
                                if changed.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Err(err) if err.is_auth_failure() => {
                        tracing::error!(database = %name, error = %err, "Replication stopped on authorization failure");
                        observer.on_event(name, ReplicationEvent::Error(err)).await;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(database = %name, error = %err, "Replication pass failed");
                        observer.on_event(name, ReplicationEvent::Error(err)).await;
                        if !self.options.retry {
                            break;
                        }
                        failures = failures.saturating_add(1);
                        let delay = self.options.retry_policy.delay_for_attempt(failures);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }

                if cancel.is_cancelled() {
                    break;
                }
            }

            tracing::info!(database = %name, "Replication ended");
        })
    }
}
