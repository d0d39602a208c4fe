//! Index manager.
//!
//! Index creation is idempotent in the store but still costs a write lock
//! and a build pass, so created field lists are memoized per database name.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use till_engine::{IndexCreation, IndexSpec};

use crate::error::Result;

/// Something indexes can be created on.
#[async_trait]
pub trait IndexTarget: Send + Sync {
    fn name(&self) -> &str;

    async fn create_index(&self, spec: IndexSpec) -> Result<IndexCreation>;
}

#[derive(Debug, Default)]
pub struct IndexManager {
    created: DashMap<String, HashSet<Vec<String>>>,
}

impl IndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_memoized(&self, db: &str, fields: &[String]) -> bool {
        self.created
            .get(db)
            .is_some_and(|set| set.contains(fields))
    }

    /// Guarantee an index over `spec.fields` exists.
    ///
    /// Returns `true` when the store was asked to create it.
    pub async fn ensure_index(&self, target: &dyn IndexTarget, spec: IndexSpec) -> Result<bool> {
        let db = target.name().to_string();
        if self.is_memoized(&db, &spec.fields) {
            return Ok(false);
        }

        let fields = spec.fields.clone();
        let outcome = target.create_index(spec).await?;
        tracing::debug!(database = %db, fields = ?fields, outcome = ?outcome, "Index ensured");
        self.created.entry(db).or_default().insert(fields);
        Ok(true)
    }

    /// Ensure each spec in order, stopping at the first failure.
    pub async fn ensure_all(&self, target: &dyn IndexTarget, specs: Vec<IndexSpec>) -> Result<()> {
        for spec in specs {
            self.ensure_index(target, spec).await?;
        }
        Ok(())
    }

    /// Drop the memo for a destroyed database.
    pub fn forget(&self, db: &str) {
        self.created.remove(db);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DataError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTarget {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl IndexTarget for CountingTarget {
        fn name(&self) -> &str {
            "products"
        }

        async fn create_index(&self, _spec: IndexSpec) -> Result<IndexCreation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DataError::Storage("quota exceeded".into()));
            }
            Ok(IndexCreation::Created)
        }
    }

    #[tokio::test]
    async fn second_call_is_a_no_op() {
        let manager = IndexManager::new();
        let target = CountingTarget::default();

        assert!(manager.ensure_index(&target, IndexSpec::on(&["barcode"])).await.unwrap());
        assert!(!manager.ensure_index(&target, IndexSpec::on(&["barcode"])).await.unwrap());
        assert_eq!(target.calls.load(Ordering::SeqCst), 1);

        manager.ensure_index(&target, IndexSpec::on(&["name"])).await.unwrap();
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_is_not_memoized() {
        let manager = IndexManager::new();
        let target = CountingTarget {
            fail: true,
            ..Default::default()
        };
        assert!(manager.ensure_index(&target, IndexSpec::on(&["barcode"])).await.is_err());
        assert!(manager.ensure_index(&target, IndexSpec::on(&["barcode"])).await.is_err());
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn forget_allows_recreation() {
        let manager = IndexManager::new();
        let target = CountingTarget::default();
        manager.ensure_all(&target, vec![IndexSpec::on(&["barcode"])]).await.unwrap();
        manager.forget("products");
        manager.ensure_all(&target, vec![IndexSpec::on(&["barcode"])]).await.unwrap();
        assert_eq!(target.calls.load(Ordering::SeqCst), 2);
    }
}
