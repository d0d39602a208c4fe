//! # Till Engine
//!
//! Embedded document-store primitives for the Till point-of-sale data layer.
//!
//! The engine is synchronous and deterministic: it has no knowledge of
//! files, network or runtime. The async policy layer (`till-data`) wraps one
//! [`DocumentStore`] per entity type and drives replication on top of the
//! capabilities exposed here.
//!
//! ## Core Concepts
//!
//! ### Documents and revisions
//!
//! Every [`Document`] has an immutable id and a [`Revision`] token assigned
//! by the store on each successful write. A write must carry the current
//! token (optimistic concurrency); a stale token is rejected with
//! [`Error::RevisionConflict`] and the caller re-reads and retries.
//!
//! ### Change feed
//!
//! Writes are numbered with a monotonically increasing sequence. The
//! [`DocumentStore::changes_since`] feed is what replication reads from.
//!
//! ### Replicated writes
//!
//! [`DocumentStore::apply_replicated`] merges revisions produced elsewhere.
//! Concurrent edits are not resolved: both revisions are kept as siblings,
//! a deterministic winner is exposed, and [`DocumentStore::conflicts`]
//! lists the losers for review.
//!
//! ### Indexes and purge
//!
//! Secondary indexes ([`IndexSpec`]) speed up equality lookups via
//! [`Selector`]. [`DocumentStore::purge`] removes a document and its history
//! where the [`Adapter`] supports it.
//!
//! ## Quick Start
//!
//! ```rust
//! use till_engine::{Adapter, Document, DocumentStore, IndexSpec, Selector, StoreOptions};
//! use serde_json::json;
//!
//! let mut store = DocumentStore::open("customers", StoreOptions::new(Adapter::Memory)).unwrap();
//! store.create_index(IndexSpec::on(&["document"])).unwrap();
//!
//! let written = store
//!     .put(Document::new("c-1", json!({"name": "Jane Doe", "document": "DOC123"})))
//!     .unwrap();
//! assert_eq!(written.rev.generation, 1);
//!
//! let found = store.find(&Selector::new().eq("document", "DOC123")).unwrap();
//! assert_eq!(found.len(), 1);
//! ```

pub mod adapter;
pub mod document;
pub mod error;
pub mod index;
pub mod revision;
pub mod schema;
pub mod store;

// Re-export main types at crate root
pub use adapter::Adapter;
pub use document::{Document, WriteResult, REVS_LIMIT};
pub use error::Error;
pub use index::{IndexCreation, IndexSpec, Selector};
pub use revision::Revision;
pub use schema::{FieldDef, FieldType, Schema};
pub use store::{
    Change, ChangesBatch, DocumentStore, ReplicatedWrite, StoreInfo, StoreOptions,
};

/// Type aliases for clarity
pub type DocId = String;
pub type Seq = u64;
pub type Timestamp = u64;
