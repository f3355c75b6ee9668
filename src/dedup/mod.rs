//! Deduplication store
//!
//! Records sender-intent deduplication keys with a TTL. A key is marked
//! when its owning message is enqueued and re-checked before dispatch;
//! the mark is never rolled back on handler failure. Marks are
//! owner-aware so a retried message passes its own mark while any other
//! live owner collapses the duplicate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::storage::StorageResult;

pub mod memory;
pub mod redis;
pub mod sql;

pub use memory::InMemoryDedupStore;
pub use redis::RedisDedupStore;
pub use sql::SqlDedupStore;

/// Result of attempting to mark a deduplication key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// The key was recorded (or refreshed by its owner)
    Fresh,
    /// A live entry owned by a different message exists
    Duplicate,
}

/// TTL'd store of processed message identifiers
#[async_trait]
pub trait DeduplicationStore: Send + Sync {
    /// Atomically record `key -> owner_id` with expiry `now + ttl` iff
    /// no live entry exists or the live entry already belongs to
    /// `owner_id` (which refreshes the expiry)
    async fn try_mark(&self, key: &str, owner_id: &str, ttl: Duration)
        -> StorageResult<DedupOutcome>;

    /// Whether a live entry exists for `key`, regardless of owner
    async fn is_marked(&self, key: &str) -> StorageResult<bool>;

    /// Drop expired entries; returns the number reclaimed
    async fn purge(&self, now: DateTime<Utc>) -> StorageResult<u64>;
}
