//! Storage provider contract
//!
//! Defines the durable queue every backend must implement: enqueue,
//! lease, acknowledge, nack with retry policy, lease release/extension,
//! and observability operations. Three reference backends satisfy the
//! contract with identical semantics:
//!
//! - `memory`: concurrent map plus keyed group locks
//! - `sql`: PostgreSQL tables leased with `FOR UPDATE SKIP LOCKED`
//! - `redis`: sorted-set pending index plus short-TTL group lock keys

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::core::envelope::{EnqueueOutcome, MessageEnvelope};

pub mod factory;
pub mod memory;
pub mod redis;
pub mod sql;

pub use factory::{InboxResources, ProviderFactory};
pub use memory::InMemoryStorageProvider;
pub use redis::RedisStorageProvider;
pub use sql::SqlStorageProvider;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("lease expired or mismatched for message: {0}")]
    LeaseExpired(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("schema error: {0}")]
    Schema(String),
}

impl StorageError {
    /// Whether the caller should retry after a backoff.
    ///
    /// Transient errors (connectivity, contention, lease races) back
    /// off and retry; everything else is fatal to the calling inbox.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Redis(e) => !matches!(
                e.kind(),
                ::redis::ErrorKind::AuthenticationFailed | ::redis::ErrorKind::InvalidClientConfig
            ),
            StorageError::Sql(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            StorageError::Unavailable(_) | StorageError::LeaseExpired(_) => true,
            StorageError::Serialization(_)
            | StorageError::Schema(_)
            | StorageError::MessageNotFound(_) => false,
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Outcome of a negative acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Rescheduled for another attempt
    Rescheduled {
        /// When the message becomes visible again
        next_visible_at: DateTime<Utc>,
        /// Attempt counter after the failure
        attempt: u32,
    },
    /// Retries exhausted (or failure non-retryable); moved to the
    /// dead-letter store
    DeadLettered {
        /// Attempt counter at dead-lettering time
        final_attempt: u32,
    },
}

/// Queue depth counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    /// Messages waiting or backing off
    pub ready: u64,
    /// Messages under a live lease
    pub leased: u64,
    /// Terminal successes still retained
    pub succeeded: u64,
    /// Messages moved to the dead-letter store
    pub dead_lettered: u64,
    /// Distinct FIFO groups with non-terminal messages
    pub groups: u64,
}

/// Durable per-inbox queue contract
///
/// Implementations own the deduplication store (consulted on enqueue),
/// the dead-letter store (fed by exhausted nacks), the retry policy,
/// and the FIFO mode flag. Lease tokens are opaque strings; every
/// mutating operation validates the caller's token against the live
/// lease and fails with [`StorageError::LeaseExpired`] on mismatch.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Persist an envelope.
    ///
    /// Assigns the enqueue timestamp. Returns `DuplicateId` when the id
    /// is already present, or `DedupHit` when the envelope carries a
    /// dedup key owned by another live message; a dedup-hit envelope is
    /// persisted already terminal and never dispatches.
    async fn enqueue(&self, envelope: MessageEnvelope) -> StorageResult<EnqueueOutcome>;

    /// Lease up to `max` visible messages for `visibility`.
    ///
    /// Selection order: ascending `next_visible_at`, ties by
    /// `enqueued_at`, then `group_seq`. In FIFO mode a group is leased
    /// only through its head (lowest pending seq, which must be
    /// visible), the result is one maximal run of consecutive sequence
    /// numbers from a single group, and at most one holder per group
    /// exists at any time.
    async fn lease_batch(
        &self,
        max: usize,
        visibility: Duration,
    ) -> StorageResult<Vec<MessageEnvelope>>;

    /// Mark a leased message succeeded
    async fn acknowledge(&self, id: &str, lease: &str) -> StorageResult<()>;

    /// Record a failed dispatch.
    ///
    /// Increments the attempt counter; reschedules with backoff while
    /// attempts remain and the failure is retryable, otherwise copies
    /// the message to the dead-letter store and removes it from the
    /// queue.
    async fn nack(
        &self,
        id: &str,
        lease: &str,
        reason: &str,
        retryable: bool,
    ) -> StorageResult<NackOutcome>;

    /// Return a leased message to the queue without consuming an
    /// attempt; it becomes visible after `delay`
    async fn release(&self, id: &str, lease: &str, delay: Duration) -> StorageResult<()>;

    /// Push the lease horizon out by `additional`; for long-running
    /// handlers
    async fn extend(&self, id: &str, lease: &str, additional: Duration) -> StorageResult<()>;

    /// Non-destructive view of up to `max` messages in selection order
    async fn peek(&self, max: usize) -> StorageResult<Vec<MessageEnvelope>>;

    /// Drop terminal successes older than `older_than`; returns the
    /// number removed
    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> StorageResult<u64>;

    /// Queue depth counters
    async fn stats(&self) -> StorageResult<StorageStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Unavailable("conn reset".into()).is_transient());
        assert!(StorageError::LeaseExpired("msg-1".into()).is_transient());
        assert!(!StorageError::Schema("missing column".into()).is_transient());
        assert!(!StorageError::MessageNotFound("msg-1".into()).is_transient());
        assert!(StorageError::Sql(sqlx::Error::PoolTimedOut).is_transient());
    }
}
