//! In-memory deduplication store
//!
//! Concurrent map of `key -> (owner, expires_at)`. Expired entries are
//! treated as absent on read and reclaimed by [`purge`], which the
//! owning inbox runs opportunistically between poll cycles.
//!
//! [`purge`]: crate::dedup::DeduplicationStore::purge

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;

use super::{DedupOutcome, DeduplicationStore};
use crate::core::clock::Clock;
use crate::storage::StorageResult;

#[derive(Debug, Clone)]
struct DedupEntry {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// Concurrent-map deduplication store
pub struct InMemoryDedupStore {
    entries: DashMap<String, DedupEntry>,
    clock: Arc<dyn Clock>,
}

impl InMemoryDedupStore {
    /// Create an empty store reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Number of entries, live or expired
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl DeduplicationStore for InMemoryDedupStore {
    async fn try_mark(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> StorageResult<DedupOutcome> {
        let now = self.clock.utc_now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| {
            chrono::Duration::seconds(i64::MAX / 1_000)
        });

        // Entry-level lock makes the check-and-set atomic per key
        let mut outcome = DedupOutcome::Fresh;
        self.entries
            .entry(key.to_string())
            .and_modify(|entry| {
                if entry.expires_at > now && entry.owner != owner_id {
                    outcome = DedupOutcome::Duplicate;
                } else {
                    entry.owner = owner_id.to_string();
                    entry.expires_at = expires_at;
                }
            })
            .or_insert_with(|| DedupEntry {
                owner: owner_id.to_string(),
                expires_at,
            });

        Ok(outcome)
    }

    async fn is_marked(&self, key: &str) -> StorageResult<bool> {
        let now = self.clock.utc_now();
        Ok(self
            .entries
            .get(key)
            .map(|entry| entry.expires_at > now)
            .unwrap_or(false))
    }

    async fn purge(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn store() -> (Arc<ManualClock>, InMemoryDedupStore) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = InMemoryDedupStore::new(clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn test_fresh_then_duplicate() {
        let (_, store) = store();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.try_mark("k", "msg-1", ttl).await.unwrap(),
            DedupOutcome::Fresh
        );
        assert_eq!(
            store.try_mark("k", "msg-2", ttl).await.unwrap(),
            DedupOutcome::Duplicate
        );
        assert!(store.is_marked("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_owner_remarks_fresh() {
        let (_, store) = store();
        let ttl = Duration::from_secs(60);

        store.try_mark("k", "msg-1", ttl).await.unwrap();
        assert_eq!(
            store.try_mark("k", "msg-1", ttl).await.unwrap(),
            DedupOutcome::Fresh
        );
    }

    #[tokio::test]
    async fn test_expiry_frees_key() {
        let (clock, store) = store();
        let ttl = Duration::from_secs(10);

        store.try_mark("k", "msg-1", ttl).await.unwrap();
        clock.advance(Duration::from_secs(11));

        assert!(!store.is_marked("k").await.unwrap());
        assert_eq!(
            store.try_mark("k", "msg-2", ttl).await.unwrap(),
            DedupOutcome::Fresh
        );
    }

    #[tokio::test]
    async fn test_purge_reclaims_expired() {
        let (clock, store) = store();

        store
            .try_mark("short", "a", Duration::from_secs(5))
            .await
            .unwrap();
        store
            .try_mark("long", "b", Duration::from_secs(500))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(6));
        let reclaimed = store.purge(clock.utc_now()).await.unwrap();

        assert_eq!(reclaimed, 1);
        assert_eq!(store.len(), 1);
        assert!(store.is_marked("long").await.unwrap());
    }
}
