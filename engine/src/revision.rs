//! Revision tokens for optimistic concurrency.
//!
//! A revision is written as `<generation>-<digest>`. The generation counts
//! writes to a document; the digest is derived from the parent revision and
//! the new content, so two stores that apply the same edit to the same parent
//! produce the same token.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Length of the hex digest kept in a revision token.
const DIGEST_LEN: usize = 32;

/// An opaque, monotonically advancing revision token.
///
/// Ordering rules:
/// 1. Higher generation wins
/// 2. If generations are equal, the lexicographically higher digest wins
///
/// This is the same total order used to pick a winner among conflicting
/// siblings, so every replica agrees on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision {
    pub generation: u64,
    pub digest: String,
}

impl Revision {
    /// Revision for the first write of a document.
    pub fn first(body: &serde_json::Value, deleted: bool) -> Self {
        Self::derive(None, 1, body, deleted)
    }

    /// Revision that follows `self` for the given content.
    pub fn next(&self, body: &serde_json::Value, deleted: bool) -> Self {
        Self::derive(Some(self), self.generation + 1, body, deleted)
    }

    fn derive(
        parent: Option<&Revision>,
        generation: u64,
        body: &serde_json::Value,
        deleted: bool,
    ) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([deleted as u8]);
        // serde_json maps are ordered, so this is canonical.
        hasher.update(body.to_string().as_bytes());
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(DIGEST_LEN);
        Self { generation, digest }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for Revision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| Error::InvalidRevision(s.to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| Error::InvalidRevision(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(Error::InvalidRevision(s.to_string()));
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

impl Ord for Revision {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.generation.cmp(&other.generation) {
            Ordering::Equal => self.digest.cmp(&other.digest),
            other => other,
        }
    }
}

impl PartialOrd for Revision {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Revision {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Revision {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_revision_is_generation_one() {
        let rev = Revision::first(&json!({"name": "Jane"}), false);
        assert_eq!(rev.generation, 1);
        assert_eq!(rev.digest.len(), DIGEST_LEN);
    }

    #[test]
    fn next_advances_generation_and_changes_token() {
        let body = json!({"name": "Jane"});
        let first = Revision::first(&body, false);
        let second = first.next(&body, false);
        assert_eq!(second.generation, 2);
        assert_ne!(first, second);
        assert!(first < second);
    }

    #[test]
    fn derivation_is_deterministic() {
        let body = json!({"a": 1, "b": [1, 2]});
        assert_eq!(Revision::first(&body, false), Revision::first(&body, false));
        assert_ne!(Revision::first(&body, false), Revision::first(&body, true));
    }

    #[test]
    fn parse_and_display() {
        let rev: Revision = "3-deadbeef".parse().unwrap();
        assert_eq!(rev.generation, 3);
        assert_eq!(rev.digest, "deadbeef");
        assert_eq!(rev.to_string(), "3-deadbeef");
    }

    #[test]
    fn parse_rejects_malformed_tokens() {
        for bad in ["", "abc", "0-abc", "x-abc", "3-"] {
            assert!(bad.parse::<Revision>().is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn ordering_breaks_ties_on_digest() {
        let a: Revision = "2-aaa".parse().unwrap();
        let b: Revision = "2-bbb".parse().unwrap();
        let c: Revision = "3-000".parse().unwrap();
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn serializes_as_string() {
        let rev: Revision = "4-cafe".parse().unwrap();
        assert_eq!(serde_json::to_string(&rev).unwrap(), "\"4-cafe\"");
        let back: Revision = serde_json::from_str("\"4-cafe\"").unwrap();
        assert_eq!(back, rev);
    }
}
