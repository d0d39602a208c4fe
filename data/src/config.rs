//! Configuration management for the data layer.

use std::env;
use std::fmt;
use std::time::Duration;
use till_engine::Adapter;

use crate::replication::RetryPolicy;

/// Credentials presented to the remote endpoint.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Data layer configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Remote endpoint base URL
    pub remote_url: Option<String>,
    /// Remote credentials
    pub credentials: Option<Credentials>,
    /// Global sync switch
    pub sync_enabled: bool,
    /// Storage backend for local stores
    pub adapter: Adapter,
    /// Documents per replication batch
    pub batch_size: usize,
    /// Backoff for transient replication failures
    pub retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            remote_url: None,
            credentials: None,
            sync_enabled: false,
            adapter: Adapter::default(),
            batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let remote_url = get("TILL_REMOTE_URL").map(|url| url.trim_end_matches('/').to_string());
        if let Some(url) = &remote_url {
            if !(url.starts_with("http://") || url.starts_with("https://") || url.starts_with("memory://")) {
                return Err(ConfigError::InvalidRemoteUrl(url.clone()));
            }
        }

        let credentials = match (get("TILL_REMOTE_USERNAME"), get("TILL_REMOTE_PASSWORD")) {
            (Some(username), Some(password)) => Some(Credentials { username, password }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteCredentials),
        };

        let sync_enabled = match get("TILL_SYNC_ENABLED") {
            Some(v) => parse_bool(&v).ok_or(ConfigError::InvalidValue {
                key: "TILL_SYNC_ENABLED",
                value: v,
            })?,
            None => false,
        };

        let adapter = match get("TILL_STORAGE_ADAPTER") {
            Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "TILL_STORAGE_ADAPTER",
                value: v,
            })?,
            None => Adapter::default(),
        };

        let batch_size = parse_number(&get, "TILL_SYNC_BATCH_SIZE", 100)?;
        if batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TILL_SYNC_BATCH_SIZE",
                value: "0".into(),
            });
        }

        let initial = parse_number(&get, "TILL_SYNC_RETRY_INITIAL_MS", 1_000)?;
        let max = parse_number(&get, "TILL_SYNC_RETRY_MAX_MS", 60_000)?;
        let retry = RetryPolicy::new(Duration::from_millis(initial as u64))
            .with_max_delay(Duration::from_millis(max.max(initial) as u64));

        Ok(Self {
            remote_url,
            credentials,
            sync_enabled,
            adapter,
            batch_size,
            retry,
        })
    }

    /// Whether replication can run at all.
    pub fn sync_possible(&self) -> bool {
        self.sync_enabled && self.remote_url.is_some()
    }

    /// Remote collection URL for a database name.
    pub fn remote_collection_url(&self, db_name: &str) -> Option<String> {
        self.remote_url
            .as_ref()
            .map(|base| format!("{base}/{db_name}"))
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_number<G>(get: &G, key: &'static str, default: usize) -> Result<usize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value: v }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TILL_REMOTE_URL must be an http(s) or memory URL, got {0}")]
    InvalidRemoteUrl(String),

    #[error("TILL_REMOTE_USERNAME and TILL_REMOTE_PASSWORD must be set together")]
    IncompleteCredentials,

    #[error("Invalid {key} value: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(!config.sync_enabled);
        assert!(config.remote_url.is_none());
        assert_eq!(config.adapter, Adapter::IndexedDb);
        assert_eq!(config.batch_size, 100);
        assert!(!config.sync_possible());
    }

    #[test]
    fn full_configuration() {
        let config = Config::from_lookup(lookup(&[
            ("TILL_REMOTE_URL", "https://couch.example.com/"),
            ("TILL_REMOTE_USERNAME", "till"),
            ("TILL_REMOTE_PASSWORD", "secret"),
            ("TILL_SYNC_ENABLED", "yes"),
            ("TILL_STORAGE_ADAPTER", "memory"),
            ("TILL_SYNC_BATCH_SIZE", "25"),
            ("TILL_SYNC_RETRY_INITIAL_MS", "50"),
            ("TILL_SYNC_RETRY_MAX_MS", "500"),
        ]))
        .unwrap();

        assert!(config.sync_possible());
        assert_eq!(config.adapter, Adapter::Memory);
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(50));
        assert_eq!(config.retry.max_delay, Duration::from_millis(500));
        assert_eq!(
            config.remote_collection_url("orders").as_deref(),
            Some("https://couch.example.com/orders")
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("TILL_SYNC_ENABLED", "maybe")])),
            Err(ConfigError::InvalidValue { key: "TILL_SYNC_ENABLED", .. })
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("TILL_STORAGE_ADAPTER", "websql")])),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("TILL_REMOTE_URL", "ftp://x")])),
            Err(ConfigError::InvalidRemoteUrl(_))
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("TILL_REMOTE_USERNAME", "till")])),
            Err(ConfigError::IncompleteCredentials)
        ));
        assert!(matches!(
            Config::from_lookup(lookup(&[("TILL_SYNC_BATCH_SIZE", "0")])),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn enabled_without_remote_is_not_possible() {
        let config = Config::from_lookup(lookup(&[("TILL_SYNC_ENABLED", "true")])).unwrap();
        assert!(config.sync_enabled);
        assert!(!config.sync_possible());
    }

    #[test]
    fn debug_redacts_password() {
        let creds = Credentials {
            username: "till".into(),
            password: "hunter2".into(),
        };
        let text = format!("{creds:?}");
        assert!(text.contains("till"));
        assert!(!text.contains("hunter2"));
    }
}
