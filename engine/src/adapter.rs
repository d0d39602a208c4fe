//! Storage adapter selection and capabilities.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Storage backend a store is opened with.
///
/// Capabilities differ per backend; the policy layer asks before relying on
/// an optional one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adapter {
    /// Volatile, process memory only
    Memory,
    /// Current browser backend
    #[default]
    IndexedDb,
    /// Legacy browser backend
    Idb,
}

impl Adapter {
    /// Whether documents can be purged (history removed, not tombstoned).
    pub fn supports_purge(&self) -> bool {
        match self {
            Adapter::Memory | Adapter::IndexedDb => true,
            Adapter::Idb => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Adapter::Memory => "memory",
            Adapter::IndexedDb => "indexeddb",
            Adapter::Idb => "idb",
        }
    }
}

impl fmt::Display for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Adapter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Adapter::Memory),
            "indexeddb" => Ok(Adapter::IndexedDb),
            "idb" => Ok(Adapter::Idb),
            other => Err(Error::UnknownAdapter(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn purge_capability() {
        assert!(Adapter::Memory.supports_purge());
        assert!(Adapter::IndexedDb.supports_purge());
        assert!(!Adapter::Idb.supports_purge());
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("IndexedDB".parse::<Adapter>().unwrap(), Adapter::IndexedDb);
        assert_eq!(" memory ".parse::<Adapter>().unwrap(), Adapter::Memory);
        assert!("leveldb".parse::<Adapter>().is_err());
    }
}
