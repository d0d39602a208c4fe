//! Document types for storing data.

use crate::{DocId, Revision};
use serde::{Deserialize, Serialize};

/// Maximum number of ancestor revisions kept per document.
pub const REVS_LIMIT: usize = 1000;

/// A document in the store.
///
/// `rev` is `None` only for a document that has never been written. After a
/// successful write the store fills in the revision it assigned; callers must
/// send that token back on the next write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    /// Unique identifier, immutable once created
    pub id: DocId,
    /// Current revision token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<Revision>,
    /// Soft delete flag (tombstone)
    #[serde(default)]
    pub deleted: bool,
    /// The JSON body
    pub body: serde_json::Value,
    /// Ancestor revisions, newest first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<Revision>,
}

impl Document {
    /// Create a document that has not been written yet.
    pub fn new(id: impl Into<DocId>, body: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            rev: None,
            deleted: false,
            body,
            history: Vec::new(),
        }
    }

    /// Builder-style method to carry the revision the write is based on.
    pub fn with_rev(mut self, rev: Revision) -> Self {
        self.rev = Some(rev);
        self
    }

    /// Check if document is live (not deleted).
    pub fn is_active(&self) -> bool {
        !self.deleted
    }

    /// Read a top-level string field from the body.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        self.body.get(field).and_then(|v| v.as_str())
    }

    /// Whether `rev` is the current revision or one of its ancestors.
    pub fn knows(&self, rev: &Revision) -> bool {
        self.rev.as_ref() == Some(rev) || self.history.contains(rev)
    }

    /// Move the document to a new revision, keeping the old one as ancestor.
    pub(crate) fn advance(&mut self, body: serde_json::Value, deleted: bool) -> Revision {
        let rev = match &self.rev {
            Some(parent) => parent.next(&body, deleted),
            None => Revision::first(&body, deleted),
        };
        if let Some(parent) = self.rev.take() {
            self.history.insert(0, parent);
            self.history.truncate(REVS_LIMIT);
        }
        self.body = body;
        self.deleted = deleted;
        self.rev = Some(rev.clone());
        rev
    }

    /// Sort key used to pick a winner among conflicting siblings.
    pub(crate) fn winner_key(&self) -> (bool, Option<&Revision>) {
        (!self.deleted, self.rev.as_ref())
    }
}

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteResult {
    pub id: DocId,
    pub rev: Revision,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_document_has_no_revision() {
        let doc = Document::new("cust-1", json!({"name": "Jane Doe"}));
        assert_eq!(doc.id, "cust-1");
        assert!(doc.rev.is_none());
        assert!(doc.is_active());
        assert_eq!(doc.str_field("name"), Some("Jane Doe"));
    }

    #[test]
    fn advance_records_history() {
        let mut doc = Document::new("cust-1", json!({"name": "Jane"}));
        let first = doc.advance(json!({"name": "Jane"}), false);
        let second = doc.advance(json!({"name": "Jane Doe"}), false);

        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(doc.rev.as_ref(), Some(&second));
        assert_eq!(doc.history, vec![first.clone()]);
        assert!(doc.knows(&first));
        assert!(doc.knows(&second));
    }

    #[test]
    fn tombstone_is_not_active() {
        let mut doc = Document::new("p-1", json!({"name": "Cola"}));
        doc.advance(json!({"name": "Cola"}), false);
        doc.advance(json!({}), true);
        assert!(!doc.is_active());
        assert_eq!(doc.rev.as_ref().map(|r| r.generation), Some(2));
    }

    #[test]
    fn live_sibling_beats_deleted_sibling() {
        let mut live = Document::new("x", json!({}));
        live.advance(json!({"v": 1}), false);
        let mut dead = Document::new("x", json!({}));
        dead.advance(json!({"v": 2}), false);
        dead.advance(json!({"v": 2}), false);
        dead.advance(json!({}), true);

        assert!(live.winner_key() > dead.winner_key());
    }

    #[test]
    fn serialization_skips_empty_history() {
        let doc = Document::new("o-1", json!({"status": "pending"}));
        let text = serde_json::to_string(&doc).unwrap();
        assert!(!text.contains("history"));
        assert!(!text.contains("rev"));
        let parsed: Document = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, doc);
    }
}
