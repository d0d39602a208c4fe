//! Entity services.
//!
//! Services validate bodies against their schema before touching the store,
//! enforce the uniqueness rules the store itself does not know about, and
//! route every call through the error tracker. Records are plain
//! [`Document`]s; bodies are JSON objects.

mod customers;
mod operators;
mod orders;
mod products;

pub use customers::CustomerService;
pub use operators::OperatorService;
pub use orders::{OrderService, OrderStatus};
pub use products::ProductService;

use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use till_engine::{Document, Revision, Schema, Selector, WriteResult};

use crate::entity::EntityType;
use crate::error::{DataError, Result};
use crate::handle::DatabaseHandle;
use crate::registry::DatabaseRegistry;
use crate::tracking::{tracked, ErrorTracker};

/// Shared plumbing for one entity's service.
#[derive(Clone)]
pub(crate) struct Repository {
    entity: EntityType,
    schema: Arc<Schema>,
    registry: Arc<DatabaseRegistry>,
    tracker: Arc<dyn ErrorTracker>,
    /// Field whose value must be unique across live records
    unique: Option<&'static str>,
}

impl Repository {
    pub(crate) fn new(
        entity: EntityType,
        schema: Schema,
        registry: Arc<DatabaseRegistry>,
        tracker: Arc<dyn ErrorTracker>,
    ) -> Self {
        Self {
            entity,
            schema: Arc::new(schema),
            registry,
            tracker,
            unique: None,
        }
    }

    pub(crate) fn unique_on(mut self, field: &'static str) -> Self {
        self.unique = Some(field);
        self
    }

    pub(crate) fn entity(&self) -> EntityType {
        self.entity
    }

    pub(crate) async fn handle(&self) -> Result<Arc<DatabaseHandle>> {
        self.registry.get_database(self.entity).await
    }

    fn operation(&self, op: &str) -> String {
        format!("{}.{}", self.entity, op)
    }

    /// Run `fut` through the error tracker.
    pub(crate) async fn track<T, F>(&self, op: &str, metadata: Value, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tracked(self.tracker.as_ref(), &self.operation(op), metadata, fut).await
    }

    fn validate(&self, body: &Value) -> Result<()> {
        if !body.is_object() {
            return Err(DataError::Validation("body must be a JSON object".into()));
        }
        Ok(self.schema.validate(body)?)
    }

    async fn ensure_unique(&self, handle: &DatabaseHandle, body: &Value, own_id: Option<&str>) -> Result<()> {
        let Some(field) = self.unique else {
            return Ok(());
        };
        let Some(value) = body.get(field).filter(|v| !v.is_null()) else {
            return Ok(());
        };
        let taken = handle
            .find(&Selector::new().eq(field, value.clone()))
            .await?
            .into_iter()
            .any(|doc| Some(doc.id.as_str()) != own_id);
        if taken {
            let shown = value.as_str().map_or_else(|| value.to_string(), str::to_string);
            return Err(DataError::duplicate(field, shown));
        }
        Ok(())
    }

    /// Validate, check uniqueness and insert with a fresh id.
    pub(crate) async fn insert(&self, mut body: Value) -> Result<Document> {
        let now = Utc::now().timestamp_millis();
        if let Some(obj) = body.as_object_mut() {
            obj.entry("createdAt").or_insert_with(|| Value::from(now));
            obj.insert("updatedAt".into(), Value::from(now));
        }
        self.validate(&body)?;

        let handle = self.handle().await?;
        self.ensure_unique(&handle, &body, None).await?;
        let id = uuid::Uuid::new_v4().to_string();
        let written = handle.put(Document::new(id, body)).await?;
        handle.get(&written.id).await
    }

    pub(crate) async fn fetch(&self, id: &str) -> Result<Document> {
        self.handle().await?.get(id).await
    }

    /// Merge `changes` into the current body and write it against `rev`.
    pub(crate) async fn patch(&self, id: &str, rev: Revision, changes: Value) -> Result<Document> {
        let Value::Object(changes) = changes else {
            return Err(DataError::Validation("changes must be a JSON object".into()));
        };
        for (key, value) in &changes {
            if let Some(field) = self.schema.field(key) {
                field.validate(Some(value))?;
            }
        }
        let handle = self.handle().await?;
        let current = handle.get(id).await?;

        let mut body: Map<String, Value> = current.body.as_object().cloned().unwrap_or_default();
        for (key, value) in changes {
            if key == "createdAt" {
                continue;
            }
            body.insert(key, value);
        }
        body.insert("updatedAt".into(), Value::from(Utc::now().timestamp_millis()));
        let body = Value::Object(body);

        self.validate(&body)?;
        self.ensure_unique(&handle, &body, Some(id)).await?;
        let written = handle.put(Document::new(id, body).with_rev(rev)).await?;
        handle.get(&written.id).await
    }

    pub(crate) async fn delete(&self, id: &str, rev: &Revision) -> Result<WriteResult> {
        self.handle().await?.remove(id, rev).await
    }

    pub(crate) async fn list(&self) -> Result<Vec<Document>> {
        self.handle().await?.all_docs().await
    }

    pub(crate) async fn find(&self, selector: Selector) -> Result<Vec<Document>> {
        self.handle().await?.find(&selector).await
    }
}

fn metadata_id(id: &str) -> Value {
    serde_json::json!({ "id": id })
}
