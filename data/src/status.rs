//! Sync status aggregation.
//!
//! The aggregator is fed by the orchestrator's event routing and never
//! drives replication itself. Per-database state lives in a `watch`
//! channel so UI code can subscribe instead of polling.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

use crate::entity::{EntityType, SyncMode};
use crate::error::{ReplicationError, ReplicationErrorKind};

/// Errors kept in the history ring.
pub const ERROR_HISTORY_LIMIT: usize = 50;

/// Where a database's replication currently is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncPhase {
    #[default]
    Inactive,
    Active,
    Paused,
    Errored,
    Stopped,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorRecord {
    pub database: String,
    pub kind: ReplicationErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Replication state of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseSyncState {
    pub phase: SyncPhase,
    pub last_error: Option<ErrorRecord>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pushed: u64,
    pub pulled: u64,
    pub purged: u64,
    pub denied: u64,
}

/// Coarse state shown in the status indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Disabled,
    Offline,
    Active,
    PushOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub state: SyncState,
    pub label: String,
    pub last_error: Option<String>,
}

/// Diagnostics for one open database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatistics {
    pub local_doc_count: usize,
    pub local_update_sequence: u64,
    pub last_sync_timestamp: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct SyncStatusAggregator {
    sync_enabled: bool,
    online: watch::Sender<bool>,
    databases: DashMap<String, watch::Sender<DatabaseSyncState>>,
    history: Mutex<VecDeque<ErrorRecord>>,
}

impl SyncStatusAggregator {
    /// `sync_enabled` is the resolved global switch (flag and remote URL).
    pub fn new(sync_enabled: bool) -> Self {
        Self {
            sync_enabled,
            online: watch::channel(true).0,
            databases: DashMap::new(),
            history: Mutex::new(VecDeque::with_capacity(ERROR_HISTORY_LIMIT)),
        }
    }

    pub fn sync_enabled_for(&self, entity: EntityType) -> bool {
        self.sync_enabled && entity.sync_mode() != SyncMode::LocalOnly
    }

    pub fn set_online(&self, online: bool) {
        if self.online.send_replace(online) != online {
            tracing::info!(online, "Network state changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    fn update<F>(&self, database: &str, f: F)
    where
        F: FnOnce(&mut DatabaseSyncState),
    {
        self.databases
            .entry(database.to_string())
            .or_insert_with(|| watch::channel(DatabaseSyncState::default()).0)
            .send_modify(f);
    }

    pub fn set_phase(&self, database: &str, phase: SyncPhase) {
        self.update(database, |s| s.phase = phase);
    }

    pub fn record_error(&self, database: &str, error: &ReplicationError) {
        let record = ErrorRecord {
            database: database.to_string(),
            kind: error.kind,
            message: error.message.clone(),
            at: Utc::now(),
        };
        {
            let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
            if history.len() == ERROR_HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(record.clone());
        }
        self.update(database, |s| {
            s.phase = SyncPhase::Errored;
            s.last_error = Some(record);
        });
    }

    pub fn record_transfer(&self, database: &str, pushed: usize, pulled: usize) {
        self.update(database, |s| {
            s.pushed += pushed as u64;
            s.pulled += pulled as u64;
            s.last_sync_at = Some(Utc::now());
        });
    }

    pub fn record_purged(&self, database: &str, purged: usize) {
        self.update(database, |s| s.purged += purged as u64);
    }

    pub fn record_denied(&self, database: &str) {
        self.update(database, |s| s.denied += 1);
    }

    /// A pass finished without error.
    pub fn mark_synced(&self, database: &str, phase: SyncPhase) {
        self.update(database, |s| {
            s.phase = phase;
            s.last_sync_at = Some(Utc::now());
        });
    }

    pub fn snapshot(&self, database: &str) -> DatabaseSyncState {
        self.databases
            .get(database)
            .map(|tx| tx.borrow().clone())
            .unwrap_or_default()
    }

    pub fn subscribe(&self, database: &str) -> watch::Receiver<DatabaseSyncState> {
        self.databases
            .entry(database.to_string())
            .or_insert_with(|| watch::channel(DatabaseSyncState::default()).0)
            .subscribe()
    }

    /// Most recent errors, oldest first.
    pub fn error_history(&self) -> Vec<ErrorRecord> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn get_sync_status(&self, entity: EntityType) -> SyncStatus {
        let snapshot = self.snapshot(entity.db_name());
        let last_error = snapshot.last_error.as_ref().map(|e| e.message.clone());

        let (state, label) = if !self.sync_enabled_for(entity) {
            (SyncState::Disabled, "Sync disabled")
        } else if !self.is_online() {
            (SyncState::Offline, "Offline, changes are saved on this device")
        } else {
            match (entity.sync_mode(), snapshot.phase) {
                (SyncMode::PushOnly, SyncPhase::Errored) => (SyncState::PushOnly, "Sending failed, will retry"),
                (SyncMode::PushOnly, _) => (SyncState::PushOnly, "Sending completed orders"),
                (_, SyncPhase::Errored) => (SyncState::Active, "Sync error"),
                (_, SyncPhase::Active) => (SyncState::Active, "Syncing"),
                (_, SyncPhase::Stopped) => (SyncState::Active, "Sync stopped"),
                _ => (SyncState::Active, "Up to date"),
            }
        };

        SyncStatus {
            state,
            label: label.to_string(),
            last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_table() {
        let disabled = SyncStatusAggregator::new(false);
        assert_eq!(disabled.get_sync_status(EntityType::Products).state, SyncState::Disabled);
        disabled.set_online(false);
        assert_eq!(disabled.get_sync_status(EntityType::Orders).state, SyncState::Disabled);

        let enabled = SyncStatusAggregator::new(true);
        assert_eq!(enabled.get_sync_status(EntityType::Products).state, SyncState::Active);
        assert_eq!(enabled.get_sync_status(EntityType::Orders).state, SyncState::PushOnly);
        assert_eq!(enabled.get_sync_status(EntityType::Affinity).state, SyncState::Disabled);

        enabled.set_online(false);
        assert_eq!(enabled.get_sync_status(EntityType::Products).state, SyncState::Offline);
        assert_eq!(enabled.get_sync_status(EntityType::Orders).state, SyncState::Offline);
    }

    #[test]
    fn errors_are_kept_and_bounded() {
        let status = SyncStatusAggregator::new(true);
        for i in 0..(ERROR_HISTORY_LIMIT + 5) {
            status.record_error("products", &ReplicationError::transient(format!("blip {i}")));
        }
        let history = status.error_history();
        assert_eq!(history.len(), ERROR_HISTORY_LIMIT);
        assert_eq!(history[0].message, "blip 5");

        let products = status.get_sync_status(EntityType::Products);
        assert_eq!(products.label, "Sync error");
        assert_eq!(products.last_error.as_deref(), Some("blip 54"));
    }

    #[test]
    fn counters_accumulate() {
        let status = SyncStatusAggregator::new(true);
        status.record_transfer("orders", 3, 0);
        status.record_transfer("orders", 2, 0);
        status.record_purged("orders", 5);
        status.record_denied("orders");

        let snapshot = status.snapshot("orders");
        assert_eq!(snapshot.pushed, 5);
        assert_eq!(snapshot.purged, 5);
        assert_eq!(snapshot.denied, 1);
        assert!(snapshot.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn subscribers_see_phase_changes() {
        let status = SyncStatusAggregator::new(true);
        let mut rx = status.subscribe("customers");
        status.set_phase("customers", SyncPhase::Active);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().phase, SyncPhase::Active);
    }
}
