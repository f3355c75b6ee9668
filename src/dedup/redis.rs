//! Redis deduplication store
//!
//! One string key per dedup key, `{prefix}dedup:{key}`, holding the
//! owner message id with a PX TTL. `SET NX PX` gives the atomic
//! check-and-set; an owner re-mark refreshes the TTL. Redis expires
//! entries itself, so `purge` is a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use std::time::Duration;

use super::{DedupOutcome, DeduplicationStore};
use crate::storage::StorageResult;

/// `SET NX PX` deduplication store
pub struct RedisDedupStore {
    redis: ConnectionManager,
    key_prefix: String,
}

impl RedisDedupStore {
    /// Create a store over an existing connection; `key_prefix` is the
    /// inbox namespace, e.g. `inbox:orders:`
    pub fn new(redis: ConnectionManager, key_prefix: String) -> Self {
        Self { redis, key_prefix }
    }

    fn key(&self, dedup_key: &str) -> String {
        format!("{}dedup:{}", self.key_prefix, dedup_key)
    }
}

#[async_trait]
impl DeduplicationStore for RedisDedupStore {
    async fn try_mark(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> StorageResult<DedupOutcome> {
        let redis_key = self.key(key);
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let set: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(owner_id)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut self.redis.clone())
            .await?;
        if set.is_some() {
            return Ok(DedupOutcome::Fresh);
        }

        let current: Option<String> = redis::cmd("GET")
            .arg(&redis_key)
            .query_async(&mut self.redis.clone())
            .await?;
        match current.as_deref() {
            Some(owner) if owner == owner_id => {
                redis::cmd("PEXPIRE")
                    .arg(&redis_key)
                    .arg(ttl_ms)
                    .query_async::<_, ()>(&mut self.redis.clone())
                    .await?;
                Ok(DedupOutcome::Fresh)
            }
            Some(_) => Ok(DedupOutcome::Duplicate),
            // Entry expired between SET and GET; claim it
            None => {
                redis::cmd("SET")
                    .arg(&redis_key)
                    .arg(owner_id)
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async::<_, ()>(&mut self.redis.clone())
                    .await?;
                Ok(DedupOutcome::Fresh)
            }
        }
    }

    async fn is_marked(&self, key: &str) -> StorageResult<bool> {
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.key(key))
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(exists > 0)
    }

    async fn purge(&self, _now: DateTime<Utc>) -> StorageResult<u64> {
        // Redis reclaims expired keys on its own
        Ok(0)
    }
}
