//! Typed publish-subscribe channels for domain events.
//!
//! Listeners are called synchronously, in subscription order. A listener
//! that returns an error or panics is logged and skipped; the others still
//! receive the event.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use till_engine::{DocId, Revision};

use crate::error::ReplicationError;

/// Error type listeners may return.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

type Listener<E> = Arc<dyn Fn(&E) -> Result<(), ListenerError> + Send + Sync>;

/// Token returned by [`EventChannel::subscribe`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping the subscription token makes it impossible to unsubscribe"]
pub struct Subscription {
    id: u64,
}

pub struct EventChannel<E> {
    name: &'static str,
    next_id: AtomicU64,
    listeners: RwLock<Vec<(u64, Listener<E>)>>,
}

impl<E> EventChannel<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        Subscription { id }
    }

    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(id, _)| *id != subscription.id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver `event` to every listener. Returns how many handled it
    /// without error.
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<(u64, Listener<E>)> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(channel = self.name, listener = id, error = %e, "Event listener failed");
                }
                Err(_) => {
                    tracing::error!(channel = self.name, listener = id, "Event listener panicked");
                }
            }
        }
        delivered
    }
}

/// Raised when the remote rejects the session's credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SessionEvent {
    Invalidated {
        database: String,
        error: ReplicationError,
    },
}

/// Order lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum OrderEvent {
    Created { id: DocId, rev: Revision },
    Completed { id: DocId, rev: Revision },
    Cancelled { id: DocId, rev: Revision },
}

impl OrderEvent {
    pub fn id(&self) -> &str {
        match self {
            OrderEvent::Created { id, .. }
            | OrderEvent::Completed { id, .. }
            | OrderEvent::Cancelled { id, .. } => id,
        }
    }
}
