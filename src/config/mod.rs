//! Per-inbox configuration and the configuration registry
//!
//! Every inbox declares its processing strategy, polling and batching
//! parameters, retry policy, deduplication TTL, and storage backend.
//! Configurations are collected in a [`ConfigRegistry`] which rejects
//! duplicate names and is consumed by the manager at startup; after
//! startup the set of inboxes is immutable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::core::backoff::{BackoffPolicy, RetryPolicy};
use crate::core::identifier::sanitize_identifier;

/// Configuration errors; all fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("duplicate inbox name: {0}")]
    DuplicateInbox(String),

    #[error("invalid inbox name: {0}")]
    InvalidName(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Offending configuration field
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },

    #[error("no handler bound for inbox: {0}")]
    MissingHandler(String),

    #[error("handler binding for inbox {inbox} does not match its type {inbox_type:?}")]
    HandlerMismatch {
        /// Inbox whose binding is wrong
        inbox: String,
        /// Declared processing type
        inbox_type: InboxType,
    },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Processing strategy variant for an inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxType {
    /// One message at a time, no ordering
    Default,
    /// Whole batches with per-message outcomes, no ordering
    Batched,
    /// Strict per-group ordering, one message per group in flight
    Fifo,
    /// Strict per-group ordering, contiguous group batches
    FifoBatched,
}

impl InboxType {
    /// Whether this variant dispatches batches to a batch handler
    pub fn is_batched(&self) -> bool {
        matches!(self, InboxType::Batched | InboxType::FifoBatched)
    }

    /// Whether this variant enforces per-group FIFO ordering
    pub fn is_fifo(&self) -> bool {
        matches!(self, InboxType::Fifo | InboxType::FifoBatched)
    }
}

/// Storage backend selection for an inbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendConfig {
    /// In-process reference backend
    Memory,
    /// PostgreSQL backend
    Sql {
        /// Connection URL
        url: String,
        /// Table name prefix, sanitized before use
        table_prefix: String,
    },
    /// Redis backend
    Redis {
        /// Connection URL
        url: String,
    },
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory
    }
}

/// Complete configuration for one named inbox
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxConfig {
    /// Unique inbox name
    pub name: String,
    /// Processing strategy variant
    pub inbox_type: InboxType,
    /// Delay between polls when no messages were available
    pub poll_interval: Duration,
    /// Maximum messages leased per cycle (batched variants)
    pub batch_size: usize,
    /// How long a leased message stays invisible to other processors
    pub visibility_timeout: Duration,
    /// Retry bound and backoff curve
    pub retry: RetryPolicy,
    /// Lifetime of deduplication entries
    pub dedup_ttl: Duration,
    /// Storage backend
    pub backend: BackendConfig,
    /// Handler dispatch fan-out bound (non-FIFO batched dispatch)
    pub max_concurrency: usize,
    /// How long `stop` waits for in-flight dispatches to drain
    pub stop_grace: Duration,
}

impl InboxConfig {
    /// Configuration with production defaults for the given name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inbox_type: InboxType::Default,
            poll_interval: Duration::from_millis(100),
            batch_size: 16,
            visibility_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            dedup_ttl: Duration::from_secs(3600),
            backend: BackendConfig::Memory,
            max_concurrency: 0,
            stop_grace: Duration::from_secs(10),
        }
    }

    /// Set the processing strategy variant
    pub fn with_type(mut self, inbox_type: InboxType) -> Self {
        self.inbox_type = inbox_type;
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lease batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set the retry bound
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts;
        self
    }

    /// Set the backoff curve
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.retry.backoff = backoff;
        self
    }

    /// Set the deduplication TTL
    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    /// Set the storage backend
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Set the dispatch fan-out bound
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Set the stop grace period
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Effective dispatch fan-out: configured limit, or the variant
    /// default (1 for FIFO variants, `batch_size` otherwise)
    pub fn effective_concurrency(&self) -> usize {
        if self.max_concurrency > 0 {
            return self.max_concurrency;
        }
        if self.inbox_type.is_fifo() {
            1
        } else {
            self.batch_size.max(1)
        }
    }

    /// Validate field ranges and the inbox name
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidName(self.name.clone()));
        }
        if sanitize_identifier(&self.name, 63).is_empty() {
            return Err(ConfigError::InvalidName(self.name.clone()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "batch_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "poll_interval",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.visibility_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "visibility_timeout",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.retry.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "backoff.multiplier",
                reason: "must be at least 1.0".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.retry.backoff.jitter) {
            return Err(ConfigError::InvalidValue {
                field: "backoff.jitter",
                reason: "must be in [0, 1)".to_string(),
            });
        }
        Ok(())
    }
}

/// Name-keyed collection of inbox configurations
///
/// Registration order is preserved for deterministic startup. The
/// registry is handed to the manager and not mutated afterwards.
#[derive(Debug, Default)]
pub struct ConfigRegistry {
    configs: BTreeMap<String, InboxConfig>,
    order: Vec<String>,
}

impl ConfigRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an inbox configuration, validating it and rejecting
    /// duplicate names
    pub fn register(&mut self, config: InboxConfig) -> ConfigResult<()> {
        config.validate()?;
        if self.configs.contains_key(&config.name) {
            return Err(ConfigError::DuplicateInbox(config.name));
        }
        self.order.push(config.name.clone());
        self.configs.insert(config.name.clone(), config);
        Ok(())
    }

    /// Look up a configuration by name
    pub fn get(&self, name: &str) -> Option<&InboxConfig> {
        self.configs.get(name)
    }

    /// Configurations in registration order
    pub fn iter(&self) -> impl Iterator<Item = &InboxConfig> {
        self.order.iter().filter_map(|name| self.configs.get(name))
    }

    /// Number of registered inboxes
    pub fn len(&self) -> usize {
        self.configs.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }
}
