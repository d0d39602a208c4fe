//! Orders and their lifecycle.
//!
//! An order is created `pending` and ends `completed` or `cancelled`. Only
//! completed orders leave the device; once the remote confirms them they
//! are purged locally.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use till_engine::{Document, FieldDef, FieldType, Revision, Schema, Selector};

use super::{metadata_id, Repository};
use crate::entity::EntityType;
use crate::error::{DataError, Result};
use crate::events::{EventChannel, OrderEvent};
use crate::registry::DatabaseRegistry;
use crate::tracking::ErrorTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }

    fn of(doc: &Document) -> Option<Self> {
        match doc.str_field("status")? {
            "pending" => Some(OrderStatus::Pending),
            "completed" => Some(OrderStatus::Completed),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn order_schema() -> Schema {
    Schema::new(
        "orders",
        vec![
            FieldDef::one_of("status", &["pending", "completed", "cancelled"]),
            FieldDef::required("terminalId", FieldType::String),
            FieldDef::required("items", FieldType::Array),
            FieldDef::required("total", FieldType::Float),
            FieldDef::required("createdAt", FieldType::Timestamp),
            FieldDef::optional("updatedAt", FieldType::Timestamp),
            FieldDef::optional("customerId", FieldType::String),
            FieldDef::optional("operatorId", FieldType::String),
        ],
    )
}

#[derive(Clone)]
pub struct OrderService {
    repo: Repository,
    events: Arc<EventChannel<OrderEvent>>,
}

impl OrderService {
    pub fn new(
        registry: Arc<DatabaseRegistry>,
        tracker: Arc<dyn ErrorTracker>,
        events: Arc<EventChannel<OrderEvent>>,
    ) -> Self {
        Self {
            repo: Repository::new(EntityType::Orders, order_schema(), registry, tracker),
            events,
        }
    }

    /// Create a pending order. Any `status` in the body is overridden.
    pub async fn create(&self, mut body: Value) -> Result<Document> {
        if let Some(obj) = body.as_object_mut() {
            obj.insert("status".into(), json!(OrderStatus::Pending.as_str()));
        }
        let meta = json!({ "terminalId": body.get("terminalId") });
        let doc = self.repo.track("create", meta, self.repo.insert(body)).await?;
        self.publish(OrderEvent::Created {
            id: doc.id.clone(),
            rev: current_rev(&doc)?,
        });
        Ok(doc)
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        self.repo.track("get", metadata_id(id), self.repo.fetch(id)).await
    }

    pub async fn complete(&self, id: &str, rev: Revision) -> Result<Document> {
        let doc = self.transition(id, rev, OrderStatus::Completed).await?;
        self.publish(OrderEvent::Completed {
            id: doc.id.clone(),
            rev: current_rev(&doc)?,
        });
        Ok(doc)
    }

    pub async fn cancel(&self, id: &str, rev: Revision) -> Result<Document> {
        let doc = self.transition(id, rev, OrderStatus::Cancelled).await?;
        self.publish(OrderEvent::Cancelled {
            id: doc.id.clone(),
            rev: current_rev(&doc)?,
        });
        Ok(doc)
    }

    async fn transition(&self, id: &str, rev: Revision, to: OrderStatus) -> Result<Document> {
        let op = async {
            let current = self.repo.fetch(id).await?;
            match OrderStatus::of(&current) {
                Some(OrderStatus::Pending) => {}
                Some(from) => {
                    return Err(DataError::Validation(format!(
                        "order {id} is already {from} and cannot become {to}"
                    )))
                }
                None => {
                    return Err(DataError::Validation(format!("order {id} has no valid status")))
                }
            }
            self.repo
                .patch(id, rev, json!({ "status": to.as_str() }))
                .await
        };
        self.repo
            .track(to.as_str(), json!({ "id": id, "status": to.as_str() }), op)
            .await
    }

    pub async fn list(&self) -> Result<Vec<Document>> {
        self.repo.track("list", Value::Null, self.repo.list()).await
    }

    pub async fn find_by_status(&self, status: OrderStatus) -> Result<Vec<Document>> {
        self.repo
            .track(
                "find_by_status",
                json!({ "status": status.as_str() }),
                self.repo.find(Selector::new().eq("status", status.as_str())),
            )
            .await
    }

    pub async fn find_by_terminal(&self, terminal_id: &str) -> Result<Vec<Document>> {
        self.repo
            .track(
                "find_by_terminal",
                json!({ "terminalId": terminal_id }),
                self.repo.find(Selector::new().eq("terminalId", terminal_id)),
            )
            .await
    }

    pub fn events(&self) -> &EventChannel<OrderEvent> {
        &self.events
    }

    fn publish(&self, event: OrderEvent) {
        let delivered = self.events.publish(&event);
        tracing::debug!(order = %event.id(), delivered, "Order event published");
    }

    pub fn entity(&self) -> EntityType {
        self.repo.entity()
    }
}

fn current_rev(doc: &Document) -> Result<Revision> {
    doc.rev
        .clone()
        .ok_or_else(|| DataError::Storage(format!("order {} was stored without a revision", doc.id)))
}
