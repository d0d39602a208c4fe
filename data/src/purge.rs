//! Purge policy for transmitted orders.
//!
//! Orders in a terminal state that the remote has confirmed are removed from
//! the device with their history, which bounds local storage on a busy till.

use serde::Serialize;
use std::collections::BTreeSet;
use till_engine::Document;

use crate::error::DataError;
use crate::handle::DatabaseHandle;

/// Outcome of one purge run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub purged: usize,
    /// Eligible but the adapter cannot purge
    pub skipped: usize,
    /// Rewritten locally after the confirmed revision; left for the next push
    pub superseded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct PurgePolicy {
    terminal: BTreeSet<String>,
}

impl Default for PurgePolicy {
    fn default() -> Self {
        Self::new(["completed"])
    }
}

impl PurgePolicy {
    pub fn new<I, S>(terminal: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terminal: terminal.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_eligible(&self, doc: &Document) -> bool {
        doc.is_active()
            && doc
                .str_field("status")
                .is_some_and(|s| self.terminal.contains(s))
    }

    /// Purge eligible documents of a confirmed batch.
    ///
    /// Only the confirmed revision is purged. Errors are logged per document
    /// and never abort the batch.
    pub async fn apply(&self, handle: &DatabaseHandle, confirmed: &[Document]) -> PurgeReport {
        let mut report = PurgeReport::default();
        let eligible: Vec<&Document> = confirmed.iter().filter(|d| self.is_eligible(d)).collect();
        if eligible.is_empty() {
            return report;
        }

        if !handle.adapter().supports_purge() {
            report.skipped = eligible.len();
            tracing::debug!(
                database = %handle.name(),
                adapter = %handle.adapter(),
                count = report.skipped,
                "Adapter cannot purge, leaving documents for compaction"
            );
            return report;
        }

        for doc in eligible {
            let Some(rev) = doc.rev.as_ref() else {
                report.failed += 1;
                tracing::warn!(database = %handle.name(), doc_id = %doc.id, "Confirmed document has no revision");
                continue;
            };
            match handle.purge_revision(&doc.id, rev).await {
                Ok(revs) => {
                    report.purged += 1;
                    tracing::debug!(database = %handle.name(), doc_id = %doc.id, revisions = revs.len(), "Purged");
                }
                Err(DataError::Conflict(_)) => {
                    report.superseded += 1;
                    tracing::debug!(database = %handle.name(), doc_id = %doc.id, rev = %rev, "Newer local revision, not purged");
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(database = %handle.name(), doc_id = %doc.id, error = %e, "Purge failed");
                }
            }
        }

        if report.purged > 0 {
            tracing::info!(database = %handle.name(), purged = report.purged, "Purged transmitted orders");
        }
        report
    }
}
