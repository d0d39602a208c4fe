//! Store - the in-memory document container.
//!
//! The store holds one collection of documents, assigns revisions on every
//! write, keeps a sequence-numbered change feed for replication, merges
//! replicated revisions (keeping conflicting ones as siblings) and maintains
//! secondary indexes.

use crate::index::{Index, IndexCreation, IndexSpec, Selector};
use crate::{error::Result, Adapter, DocId, Document, Error, Revision, Seq, WriteResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Options a store is opened with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOptions {
    pub adapter: Adapter,
    /// Maximum number of live documents, if the backend is bounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_docs: Option<usize>,
}

impl StoreOptions {
    pub fn new(adapter: Adapter) -> Self {
        Self {
            adapter,
            max_docs: None,
        }
    }

    pub fn with_max_docs(mut self, limit: usize) -> Self {
        self.max_docs = Some(limit);
        self
    }
}

/// Summary of a store, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub name: String,
    pub adapter: Adapter,
    pub doc_count: usize,
    pub update_seq: Seq,
}

/// One entry of the change feed: the latest state of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub seq: Seq,
    pub doc: Document,
}

/// A page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesBatch {
    pub results: Vec<Change>,
    /// Checkpoint to resume from
    pub last_seq: Seq,
}

impl ChangesBatch {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// How a replicated revision was merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum ReplicatedWrite {
    /// Document did not exist locally
    Inserted,
    /// Incoming revision descends from the local one
    FastForward,
    /// Revision already present, nothing to do
    AlreadyKnown,
    /// Concurrent edit; both revisions kept, `winner` is current
    Conflict { winner: Revision },
}

#[derive(Debug, Clone)]
struct Entry {
    doc: Document,
    conflicts: Vec<Document>,
    seq: Seq,
}

/// The document store for one database.
#[derive(Debug, Clone)]
pub struct DocumentStore {
    name: String,
    options: StoreOptions,
    entries: HashMap<DocId, Entry>,
    by_seq: BTreeMap<Seq, DocId>,
    update_seq: Seq,
    indexes: BTreeMap<String, Index>,
    destroyed: bool,
}

impl DocumentStore {
    /// Open an empty store.
    ///
    /// Names follow the usual document-database rules: start with a lowercase
    /// letter, then lowercase letters, digits and `_$()+-/`.
    pub fn open(name: impl Into<String>, options: StoreOptions) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            name,
            options,
            entries: HashMap::new(),
            by_seq: BTreeMap::new(),
            update_seq: 0,
            indexes: BTreeMap::new(),
            destroyed: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter(&self) -> Adapter {
        self.options.adapter
    }

    pub fn update_seq(&self) -> Seq {
        self.update_seq
    }

    /// Count of live (non-deleted) documents.
    pub fn doc_count(&self) -> usize {
        self.entries.values().filter(|e| e.doc.is_active()).count()
    }

    pub fn info(&self) -> StoreInfo {
        StoreInfo {
            name: self.name.clone(),
            adapter: self.options.adapter,
            doc_count: self.doc_count(),
            update_seq: self.update_seq,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.destroyed {
            return Err(Error::Destroyed(self.name.clone()));
        }
        Ok(())
    }

    fn check_quota(&self) -> Result<()> {
        match self.options.max_docs {
            Some(limit) if self.doc_count() >= limit => Err(Error::QuotaExceeded {
                name: self.name.clone(),
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Get a live document by id.
    pub fn get(&self, id: &str) -> Result<&Document> {
        self.ensure_open()?;
        self.entries
            .get(id)
            .map(|e| &e.doc)
            .filter(|d| d.is_active())
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))
    }

    /// Revisions of the losing siblings of a conflicted document.
    pub fn conflicts(&self, id: &str) -> Result<Vec<Revision>> {
        self.ensure_open()?;
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        Ok(entry
            .conflicts
            .iter()
            .filter(|c| c.is_active())
            .filter_map(|c| c.rev.clone())
            .collect())
    }

    /// Write a document.
    ///
    /// The document's `rev` must match the current revision, or be `None` for
    /// an id that does not exist (or was deleted). Anything else is a
    /// [`Error::RevisionConflict`].
    pub fn put(&mut self, doc: Document) -> Result<WriteResult> {
        self.ensure_open()?;
        if !doc.body.is_object() {
            return Err(Error::InvalidDocument("body must be an object".into()));
        }
        if doc.id.is_empty() {
            return Err(Error::InvalidDocument("id must not be empty".into()));
        }

        let current = self.entries.get(&doc.id).map(|e| &e.doc);
        match (current, &doc.rev) {
            (None, None) => {}
            (Some(existing), None) if existing.deleted => {}
            (Some(existing), Some(rev)) if existing.rev.as_ref() == Some(rev) => {}
            (current, expected) => {
                return Err(Error::RevisionConflict {
                    id: doc.id.clone(),
                    expected: expected.clone(),
                    actual: current.and_then(|d| d.rev.clone()),
                })
            }
        }

        let revives = current.map_or(true, |d| d.deleted);
        if revives && !doc.deleted {
            self.check_quota()?;
        }

        let mut next = current
            .cloned()
            .unwrap_or_else(|| Document::new(doc.id.clone(), serde_json::Value::Null));
        let rev = next.advance(doc.body, doc.deleted);
        let id = next.id.clone();
        self.replace_winner(next);

        Ok(WriteResult { id, rev })
    }

    /// Delete a document by writing a tombstone.
    pub fn remove(&mut self, id: &str, rev: &Revision) -> Result<WriteResult> {
        self.get(id)?;
        let mut tombstone = Document::new(id, serde_json::json!({})).with_rev(rev.clone());
        tombstone.deleted = true;
        self.put(tombstone)
    }

    /// Write several documents; each succeeds or fails on its own.
    pub fn bulk_docs(&mut self, docs: Vec<Document>) -> Vec<Result<WriteResult>> {
        docs.into_iter().map(|doc| self.put(doc)).collect()
    }

    /// All live documents, ordered by id.
    pub fn all_docs(&self) -> Result<Vec<&Document>> {
        self.ensure_open()?;
        let mut docs: Vec<_> = self
            .entries
            .values()
            .map(|e| &e.doc)
            .filter(|d| d.is_active())
            .collect();
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    /// Changes after `since`, oldest first, at most `limit` entries.
    ///
    /// Each document appears once, at the sequence of its latest write.
    /// Tombstones are included so deletions replicate.
    pub fn changes_since(&self, since: Seq, limit: usize) -> Result<ChangesBatch> {
        self.ensure_open()?;
        let results: Vec<Change> = self
            .by_seq
            .range(since + 1..)
            .take(limit)
            .filter_map(|(seq, id)| {
                self.entries.get(id).map(|e| Change {
                    seq: *seq,
                    doc: e.doc.clone(),
                })
            })
            .collect();
        let last_seq = results.last().map_or(since, |c| c.seq);
        Ok(ChangesBatch { results, last_seq })
    }

    /// Merge a revision produced by another replica.
    ///
    /// The incoming document must carry its revision and ancestry. Conflicting
    /// revisions are kept as siblings and a deterministic winner is chosen, so
    /// every replica converges on the same current revision.
    pub fn apply_replicated(&mut self, doc: Document) -> Result<ReplicatedWrite> {
        self.ensure_open()?;
        let rev = doc
            .rev
            .clone()
            .ok_or_else(|| Error::InvalidRevision(format!("replicated {} has no rev", doc.id)))?;

        let Some(entry) = self.entries.get(&doc.id) else {
            if doc.is_active() {
                self.check_quota()?;
            }
            self.replace_winner(doc);
            return Ok(ReplicatedWrite::Inserted);
        };

        if entry.doc.knows(&rev) || entry.conflicts.iter().any(|c| c.knows(&rev)) {
            return Ok(ReplicatedWrite::AlreadyKnown);
        }

        let mut siblings = entry.conflicts.clone();
        let mut winner = entry.doc.clone();
        let fast_forward = winner.rev.as_ref().is_some_and(|r| doc.knows(r));

        if fast_forward {
            winner = doc;
        } else if let Some(pos) = siblings
            .iter()
            .position(|c| c.rev.as_ref().is_some_and(|r| doc.knows(r)))
        {
            siblings[pos] = doc;
        } else {
            siblings.push(doc);
        }

        // Pick the winner over all leaves.
        siblings.push(winner);
        siblings.sort_by(|a, b| b.winner_key().cmp(&a.winner_key()));
        let winner = siblings.remove(0);
        let winner_rev = winner.rev.clone();

        let id = winner.id.clone();
        self.replace_winner(winner);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.conflicts = siblings;
        }

        if fast_forward {
            Ok(ReplicatedWrite::FastForward)
        } else {
            Ok(ReplicatedWrite::Conflict {
                winner: winner_rev.unwrap_or(rev),
            })
        }
    }

    /// Drop a losing sibling after the conflict has been reviewed.
    pub fn discard_conflict(&mut self, id: &str, rev: &Revision) -> Result<()> {
        self.ensure_open()?;
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        let before = entry.conflicts.len();
        entry.conflicts.retain(|c| c.rev.as_ref() != Some(rev));
        if entry.conflicts.len() == before {
            return Err(Error::RevisionConflict {
                id: id.to_string(),
                expected: Some(rev.clone()),
                actual: entry.doc.rev.clone(),
            });
        }
        Ok(())
    }

    /// Remove a document and its whole revision history.
    ///
    /// Unlike [`remove`](Self::remove), nothing is left behind to replicate.
    /// Returns the purged leaf revisions.
    pub fn purge(&mut self, id: &str) -> Result<Vec<Revision>> {
        self.ensure_open()?;
        if !self.options.adapter.supports_purge() {
            return Err(Error::PurgeUnsupported(self.options.adapter));
        }
        let entry = self
            .entries
            .remove(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?;
        self.by_seq.remove(&entry.seq);
        for index in self.indexes.values_mut() {
            index.remove(&entry.doc);
        }
        Ok(std::iter::once(&entry.doc)
            .chain(entry.conflicts.iter())
            .filter_map(|d| d.rev.clone())
            .collect())
    }

    /// Purge `id` only while `rev` is still its current revision.
    ///
    /// A newer local write since `rev` was read fails with
    /// [`Error::RevisionConflict`] and leaves the document in place.
    pub fn purge_revision(&mut self, id: &str, rev: &Revision) -> Result<Vec<Revision>> {
        self.ensure_open()?;
        let current = self
            .entries
            .get(id)
            .ok_or_else(|| Error::DocumentNotFound(id.to_string()))?
            .doc
            .rev
            .clone();
        if current.as_ref() != Some(rev) {
            return Err(Error::RevisionConflict {
                id: id.to_string(),
                expected: Some(rev.clone()),
                actual: current,
            });
        }
        self.purge(id)
    }

    /// Create a secondary index, building it over existing documents.
    pub fn create_index(&mut self, spec: IndexSpec) -> Result<IndexCreation> {
        self.ensure_open()?;
        if spec.fields.is_empty() {
            return Err(Error::InvalidDocument(format!(
                "index {} has no fields",
                spec.name
            )));
        }
        if self.indexes.contains_key(&spec.name) {
            return Ok(IndexCreation::Exists);
        }
        let mut index = Index::new(spec);
        for entry in self.entries.values() {
            index.insert(&entry.doc);
        }
        self.indexes.insert(index.spec.name.clone(), index);
        Ok(IndexCreation::Created)
    }

    pub fn indexes(&self) -> Vec<&IndexSpec> {
        self.indexes.values().map(|i| &i.spec).collect()
    }

    /// Live documents matching every clause of the selector, ordered by id.
    ///
    /// Uses the index covering the most selector fields when one exists,
    /// falling back to a full scan.
    pub fn find(&self, selector: &Selector) -> Result<Vec<&Document>> {
        self.ensure_open()?;
        let planned = self
            .indexes
            .values()
            .filter_map(|index| index.lookup(selector).map(|ids| (index.spec.fields.len(), ids)))
            .max_by_key(|(width, _)| *width);

        let mut docs: Vec<&Document> = match planned {
            Some((_, ids)) => ids
                .iter()
                .filter_map(|id| self.entries.get(id))
                .map(|e| &e.doc)
                .filter(|d| d.is_active() && selector.matches(d))
                .collect(),
            None => self
                .entries
                .values()
                .map(|e| &e.doc)
                .filter(|d| d.is_active() && selector.matches(d))
                .collect(),
        };
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(docs)
    }

    /// Drop all data. Every later call fails with [`Error::Destroyed`].
    pub fn destroy(&mut self) {
        self.entries.clear();
        self.by_seq.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
        self.indexes.clear();
        self.destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Install `doc` as the current revision, keeping indexes and the change
    /// feed in step.
    fn replace_winner(&mut self, doc: Document) {
        self.update_seq += 1;
        let seq = self.update_seq;

        let previous = self.entries.remove(&doc.id);
        let conflicts = match previous {
            Some(prev) => {
                self.by_seq.remove(&prev.seq);
                for index in self.indexes.values_mut() {
                    index.remove(&prev.doc);
                }
                prev.conflicts
            }
            None => Vec::new(),
        };

        for index in self.indexes.values_mut() {
            index.insert(&doc);
        }
        self.by_seq.insert(seq, doc.id.clone());
        self.entries.insert(
            doc.id.clone(),
            Entry {
                doc,
                conflicts,
                seq,
            },
        );
    }
}

fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars.next().is_some_and(|c| c.is_ascii_lowercase());
    let valid_rest =
        chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "_$()+-/".contains(c));
    if valid_start && valid_rest {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}
