use serde_json::{json, Value};
use std::sync::Arc;
use till_engine::{Document, FieldDef, FieldType, Revision, Schema, Selector, WriteResult};

use super::{metadata_id, Repository};
use crate::entity::EntityType;
use crate::error::{DataError, Result};
use crate::registry::DatabaseRegistry;
use crate::tracking::ErrorTracker;

pub fn customer_schema() -> Schema {
    Schema::new(
        "customers",
        vec![
            FieldDef::required("name", FieldType::String),
            FieldDef::required("document", FieldType::String),
            FieldDef::optional("email", FieldType::String),
            FieldDef::optional("phone", FieldType::String),
            FieldDef::optional("createdAt", FieldType::Timestamp),
            FieldDef::optional("updatedAt", FieldType::Timestamp),
        ],
    )
}

/// Customers, unique by document number.
#[derive(Clone)]
pub struct CustomerService {
    repo: Repository,
}

impl CustomerService {
    pub fn new(registry: Arc<DatabaseRegistry>, tracker: Arc<dyn ErrorTracker>) -> Self {
        Self {
            repo: Repository::new(EntityType::Customers, customer_schema(), registry, tracker)
                .unique_on("document"),
        }
    }

    pub async fn create(&self, body: Value) -> Result<Document> {
        let meta = json!({ "document": body.get("document") });
        self.repo.track("create", meta, self.repo.insert(body)).await
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        self.repo.track("get", metadata_id(id), self.repo.fetch(id)).await
    }

    pub async fn update(&self, id: &str, rev: Revision, changes: Value) -> Result<Document> {
        self.repo
            .track("update", metadata_id(id), self.repo.patch(id, rev, changes))
            .await
    }

    pub async fn remove(&self, id: &str, rev: &Revision) -> Result<WriteResult> {
        self.repo.track("remove", metadata_id(id), self.repo.delete(id, rev)).await
    }

    pub async fn list(&self) -> Result<Vec<Document>> {
        self.repo.track("list", Value::Null, self.repo.list()).await
    }

    pub async fn find_by_document(&self, document: &str) -> Result<Document> {
        let lookup = async {
            self.repo
                .find(Selector::new().eq("document", document))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DataError::NotFound(format!("customer with document {document}")))
        };
        self.repo
            .track("find_by_document", json!({ "document": document }), lookup)
            .await
    }
}
