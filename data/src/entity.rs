//! Entity types and their per-database policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use till_engine::IndexSpec;

use crate::error::DataError;

/// How a database replicates with its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncMode {
    /// Reference data: both directions, continuous
    Bidirectional,
    /// Transactional data: outward only, filtered
    PushOnly,
    /// Never leaves the device
    LocalOnly,
}

/// One local database exists per entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Products,
    Customers,
    Operators,
    Orders,
    Affinity,
    Preferences,
    RecommenderConfig,
}

impl EntityType {
    pub const ALL: [EntityType; 7] = [
        EntityType::Products,
        EntityType::Customers,
        EntityType::Operators,
        EntityType::Orders,
        EntityType::Affinity,
        EntityType::Preferences,
        EntityType::RecommenderConfig,
    ];

    /// Name of the local store and of the remote collection.
    pub fn db_name(&self) -> &'static str {
        match self {
            EntityType::Products => "products",
            EntityType::Customers => "customers",
            EntityType::Operators => "operators",
            EntityType::Orders => "orders",
            EntityType::Affinity => "affinity",
            EntityType::Preferences => "preferences",
            EntityType::RecommenderConfig => "recommender_config",
        }
    }

    pub fn sync_mode(&self) -> SyncMode {
        match self {
            EntityType::Products | EntityType::Customers | EntityType::Operators => {
                SyncMode::Bidirectional
            }
            EntityType::Orders => SyncMode::PushOnly,
            EntityType::Affinity | EntityType::Preferences | EntityType::RecommenderConfig => {
                SyncMode::LocalOnly
            }
        }
    }

    /// Indexes the entity's query patterns rely on.
    pub fn index_specs(&self) -> Vec<IndexSpec> {
        let fields: &[&[&str]] = match self {
            EntityType::Products => &[&["barcode"], &["category"], &["name"]],
            EntityType::Customers => &[&["document"], &["name"]],
            EntityType::Operators => &[&["name"]],
            EntityType::Orders => &[&["status"], &["createdAt"], &["terminalId"]],
            EntityType::Affinity => &[&["productId"]],
            EntityType::Preferences | EntityType::RecommenderConfig => &[],
        };
        fields.iter().map(|f| IndexSpec::on(f)).collect()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.db_name())
    }
}

impl FromStr for EntityType {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|e| e.db_name() == s)
            .ok_or_else(|| DataError::NotFound(format!("unknown entity type '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_modes() {
        assert_eq!(EntityType::Products.sync_mode(), SyncMode::Bidirectional);
        assert_eq!(EntityType::Orders.sync_mode(), SyncMode::PushOnly);
        assert_eq!(EntityType::Affinity.sync_mode(), SyncMode::LocalOnly);
    }

    #[test]
    fn order_indexes() {
        let names: Vec<_> = EntityType::Orders
            .index_specs()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["idx-status", "idx-createdAt", "idx-terminalId"]);
    }

    #[test]
    fn names_round_trip() {
        for entity in EntityType::ALL {
            assert_eq!(entity.db_name().parse::<EntityType>().unwrap(), entity);
        }
        assert!("sales".parse::<EntityType>().is_err());
    }
}
