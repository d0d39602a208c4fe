use serde_json::{json, Value};
use std::sync::Arc;
use till_engine::{Document, FieldDef, FieldType, Revision, Schema, Selector, WriteResult};

use super::{metadata_id, Repository};
use crate::entity::EntityType;
use crate::error::{DataError, Result};
use crate::registry::DatabaseRegistry;
use crate::tracking::ErrorTracker;

pub fn product_schema() -> Schema {
    Schema::new(
        "products",
        vec![
            FieldDef::required("name", FieldType::String),
            FieldDef::required("barcode", FieldType::String),
            FieldDef::required("price", FieldType::Float),
            FieldDef::optional("category", FieldType::String),
            FieldDef::optional("stock", FieldType::Int),
            FieldDef::optional("createdAt", FieldType::Timestamp),
            FieldDef::optional("updatedAt", FieldType::Timestamp),
        ],
    )
}

/// Catalogue of products. Barcodes are unique.
#[derive(Clone)]
pub struct ProductService {
    repo: Repository,
}

impl ProductService {
    pub fn new(registry: Arc<DatabaseRegistry>, tracker: Arc<dyn ErrorTracker>) -> Self {
        Self {
            repo: Repository::new(EntityType::Products, product_schema(), registry, tracker)
                .unique_on("barcode"),
        }
    }

    pub async fn create(&self, body: Value) -> Result<Document> {
        let meta = json!({ "barcode": body.get("barcode") });
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

    pub async fn find_by_barcode(&self, barcode: &str) -> Result<Document> {
        let lookup = async {
            self.repo
                .find(Selector::new().eq("barcode", barcode))
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| DataError::NotFound(format!("product with barcode {barcode}")))
        };
        self.repo
            .track("find_by_barcode", json!({ "barcode": barcode }), lookup)
            .await
    }

    pub async fn find_by_category(&self, category: &str) -> Result<Vec<Document>> {
        self.repo
            .track(
                "find_by_category",
                json!({ "category": category }),
                self.repo.find(Selector::new().eq("category", category)),
            )
            .await
    }
}
