//! Secondary indexes and equality selectors.

use crate::{DocId, Document};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Definition of a secondary index over one or more body fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSpec {
    pub name: String,
    pub fields: Vec<String>,
}

impl IndexSpec {
    /// Index named after its fields, e.g. `idx-status-createdAt`.
    pub fn on(fields: &[&str]) -> Self {
        Self {
            name: format!("idx-{}", fields.join("-")),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

/// Whether `create_index` built something new.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexCreation {
    Created,
    Exists,
}

type IndexKey = Vec<String>;

/// A materialized index: key tuple to the ids carrying it.
///
/// Documents missing any indexed field, and tombstones, are not indexed.
#[derive(Debug, Clone)]
pub(crate) struct Index {
    pub(crate) spec: IndexSpec,
    entries: BTreeMap<IndexKey, BTreeSet<DocId>>,
}

impl Index {
    pub(crate) fn new(spec: IndexSpec) -> Self {
        Self {
            spec,
            entries: BTreeMap::new(),
        }
    }

    fn key_for(&self, doc: &Document) -> Option<IndexKey> {
        if doc.deleted {
            return None;
        }
        self.spec
            .fields
            .iter()
            .map(|f| doc.body.get(f).filter(|v| !v.is_null()).map(key_part))
            .collect()
    }

    pub(crate) fn insert(&mut self, doc: &Document) {
        if let Some(key) = self.key_for(doc) {
            self.entries.entry(key).or_default().insert(doc.id.clone());
        }
    }

    pub(crate) fn remove(&mut self, doc: &Document) {
        if let Some(key) = self.key_for(doc) {
            if let Some(ids) = self.entries.get_mut(&key) {
                ids.remove(&doc.id);
                if ids.is_empty() {
                    self.entries.remove(&key);
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    /// Ids matching the selector, if this index can answer it.
    pub(crate) fn lookup(&self, selector: &Selector) -> Option<Vec<DocId>> {
        let key = self
            .spec
            .fields
            .iter()
            .map(|f| selector.value_of(f).map(key_part))
            .collect::<Option<IndexKey>>()?;
        Some(
            self.entries
                .get(&key)
                .map(|ids| ids.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }
}

fn key_part(value: &serde_json::Value) -> String {
    value.to_string()
}

/// Equality selector over top-level body fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selector {
    clauses: Vec<(String, serde_json::Value)>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style equality clause.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.clauses.iter().map(|(f, _)| f.as_str())
    }

    fn value_of(&self, field: &str) -> Option<&serde_json::Value> {
        self.clauses
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v)
    }

    /// Check a document against every clause.
    pub fn matches(&self, doc: &Document) -> bool {
        doc.is_active()
            && self
                .clauses
                .iter()
                .all(|(f, v)| doc.body.get(f) == Some(v))
    }
}
