//! Queue configuration
//!
//! The queue is configured from a TOML document:
//!
//! ```toml
//! ttl = "2h"
//!
//! [persistence]
//! max_signals_to_batch = 10000
//! batch_interval = "5s"
//!
//! [[endpoint]]
//! name = "primary"
//! url = "http://localhost:9009/api/v1/push"
//! batch_count = 1000
//! flush_interval = "1s"
//! parallelism = 4
//! external_labels = { cluster = "prod" }
//! ```
//!
//! Every configuration value is validated before it is applied; an invalid
//! update is rejected and the previous configuration stays in force.

use crate::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// Resolution of the delivery loops' flush timer.
pub const TICK_RESOLUTION: Duration = Duration::from_secs(1);

/// Largest accepted `batch_count`; send loops preallocate two batches.
pub const MAX_BATCH_COUNT: usize = 100_000;

/// User agent sent with every request.
pub fn user_agent() -> String {
    format!("walqueue/{}", env!("CARGO_PKG_VERSION"))
}

/// Top-level configuration: TTL, persistence batching, and the endpoints to
/// deliver to.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Records older than this are not delivered.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    pub persistence: PersistenceConfig,
    #[serde(rename = "endpoint")]
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(2 * 60 * 60),
            persistence: PersistenceConfig::default(),
            endpoints: Vec::new(),
        }
    }
}

impl QueueConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::Config("ttl must be greater than 0".to_string()));
        }
        self.persistence.validate()?;

        let mut names = HashSet::new();
        for endpoint in &self.endpoints {
            endpoint.validate()?;
            if !names.insert(endpoint.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate endpoint name '{}'",
                    endpoint.name
                )));
            }
        }
        Ok(())
    }
}

/// How records are batched before being written to the file queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Flush to disk once this many records are buffered.
    pub max_signals_to_batch: usize,
    /// Flush to disk at least this often when the batch is not full.
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_signals_to_batch: 10_000,
            batch_interval: Duration::from_secs(5),
        }
    }
}

impl PersistenceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_signals_to_batch == 0 {
            return Err(Error::Config(
                "max_signals_to_batch must be greater than 0".to_string(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(Error::Config(
                "batch_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Basic authentication credentials.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One delivery destination as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token: Option<String>,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    /// Delay between retries when the server gives no `Retry-After`.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    /// 0 retries forever.
    pub max_retry_attempts: u32,
    /// Records per request.
    pub batch_count: usize,
    /// Send a partial batch after this long.
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// Number of shard loops.
    pub parallelism: usize,
    pub external_labels: BTreeMap<String, String>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            url: String::new(),
            basic_auth: None,
            bearer_token: None,
            write_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            max_retry_attempts: 0,
            batch_count: 1_000,
            flush_interval: Duration::from_secs(1),
            parallelism: 4,
            external_labels: BTreeMap::new(),
        }
    }
}

impl EndpointConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("endpoint name cannot be empty".to_string()));
        }
        self.to_connection_config().validate()
    }

    pub fn to_connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            url: self.url.clone(),
            basic_auth: self.basic_auth.clone(),
            bearer_token: self.bearer_token.clone().filter(|t| !t.is_empty()),
            user_agent: user_agent(),
            timeout: self.write_timeout,
            retry_backoff: self.retry_backoff,
            max_retry_attempts: self.max_retry_attempts,
            batch_count: self.batch_count,
            flush_interval: self.flush_interval,
            connections: self.parallelism,
            external_labels: self.external_labels.clone(),
        }
    }
}

/// Immutable description of how to talk to one endpoint.
///
/// Shared between the network manager and its loops behind an `Arc`; a change
/// is always a whole-value replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub url: String,
    pub basic_auth: Option<BasicAuth>,
    pub bearer_token: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    pub retry_backoff: Duration,
    pub max_retry_attempts: u32,
    pub batch_count: usize,
    pub flush_interval: Duration,
    pub connections: usize,
    pub external_labels: BTreeMap<String, String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        EndpointConfig::default().to_connection_config()
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(Error::Config("url cannot be empty".to_string()));
        }
        if self.batch_count == 0 {
            return Err(Error::Config(
                "batch_count must be greater than 0".to_string(),
            ));
        }
        if self.batch_count > MAX_BATCH_COUNT {
            return Err(Error::Config(format!(
                "batch_count must be at most {MAX_BATCH_COUNT}"
            )));
        }
        if self.flush_interval < TICK_RESOLUTION {
            return Err(Error::Config(
                "flush_interval must be greater or equal to 1s, the internal timers resolution is 1s"
                    .to_string(),
            ));
        }
        if self.connections == 0 {
            return Err(Error::Config(
                "parallelism must be greater than 0".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config(
                "write_timeout must be greater than 0".to_string(),
            ));
        }
        if self.basic_auth.is_some() && self.bearer_token.is_some() {
            return Err(Error::Config(
                "basic_auth and bearer_token are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Batching parameters for the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerializerConfig {
    pub max_signals_in_batch: usize,
    pub flush_frequency: Duration,
    /// Records older than this are dropped instead of stored.
    pub ttl: Duration,
}

impl SerializerConfig {
    pub fn new(persistence: &PersistenceConfig, ttl: Duration) -> Self {
        Self {
            max_signals_in_batch: persistence.max_signals_to_batch,
            flush_frequency: persistence.batch_interval,
            ttl,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(Error::Config("ttl must be greater than 0".to_string()));
        }
        PersistenceConfig {
            max_signals_to_batch: self.max_signals_in_batch,
            batch_interval: self.flush_frequency,
        }
        .validate()
    }
}

impl Default for SerializerConfig {
    fn default() -> Self {
        let defaults = QueueConfig::default();
        Self::new(&defaults.persistence, defaults.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str) -> EndpointConfig {
        EndpointConfig {
            name: name.to_string(),
            url: "http://localhost:9009/api/v1/push".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_full_document() {
        let raw = r#"
            ttl = "30m"

            [persistence]
            max_signals_to_batch = 500
            batch_interval = "2s"

            [[endpoint]]
            name = "primary"
            url = "http://localhost:9009/api/v1/push"
            write_timeout = "10s"
            retry_backoff = "250ms"
            max_retry_attempts = 3
            batch_count = 100
            flush_interval = "5s"
            parallelism = 2
            bearer_token = "secret"
            external_labels = { cluster = "prod" }
        "#;
        let config = QueueConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.ttl, Duration::from_secs(30 * 60));
        assert_eq!(config.persistence.max_signals_to_batch, 500);
        assert_eq!(config.endpoints.len(), 1);

        let cc = config.endpoints[0].to_connection_config();
        assert_eq!(cc.retry_backoff, Duration::from_millis(250));
        assert_eq!(cc.max_retry_attempts, 3);
        assert_eq!(cc.connections, 2);
        assert_eq!(cc.bearer_token.as_deref(), Some("secret"));
        assert_eq!(cc.external_labels.get("cluster").map(String::as_str), Some("prod"));
        assert!(cc.user_agent.starts_with("walqueue/"));
    }

    #[test]
    fn test_defaults() {
        let config = QueueConfig::from_toml_str("").unwrap();
        assert_eq!(config.ttl, Duration::from_secs(7200));
        assert_eq!(config.persistence.max_signals_to_batch, 10_000);
        assert_eq!(config.persistence.batch_interval, Duration::from_secs(5));

        let ep = EndpointConfig::default();
        assert_eq!(ep.write_timeout, Duration::from_secs(30));
        assert_eq!(ep.batch_count, 1_000);
        assert_eq!(ep.max_retry_attempts, 0);
    }

    #[test]
    fn test_rejects_zero_batch_count() {
        let mut ep = endpoint("a");
        ep.batch_count = 0;
        let err = ep.validate().unwrap_err();
        assert!(err.to_string().contains("batch_count"));
    }

    #[test]
    fn test_rejects_oversized_batch_count() {
        let mut ep = endpoint("a");
        ep.batch_count = MAX_BATCH_COUNT + 1;
        let err = ep.validate().unwrap_err();
        assert!(err.to_string().contains("at most"));
        ep.batch_count = MAX_BATCH_COUNT;
        assert!(ep.validate().is_ok());
    }

    #[test]
    fn test_rejects_sub_second_flush_interval() {
        let mut ep = endpoint("a");
        ep.flush_interval = Duration::from_millis(500);
        assert!(ep.validate().is_err());
        ep.flush_interval = Duration::from_secs(1);
        assert!(ep.validate().is_ok());
    }

    #[test]
    fn test_rejects_both_auth_modes() {
        let mut ep = endpoint("a");
        ep.basic_auth = Some(BasicAuth {
            username: "u".into(),
            password: "p".into(),
        });
        ep.bearer_token = Some("t".into());
        let err = ep.validate().unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_empty_bearer_token_is_ignored() {
        let mut ep = endpoint("a");
        ep.bearer_token = Some(String::new());
        assert!(ep.to_connection_config().bearer_token.is_none());
    }

    #[test]
    fn test_rejects_duplicate_endpoint_names() {
        let config = QueueConfig {
            endpoints: vec![endpoint("a"), endpoint("a")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_basic_auth_debug_is_redacted() {
        let auth = BasicAuth {
            username: "user".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", auth).contains("hunter2"));
    }
}
