//! Redis dead-letter store
//!
//! Append-only list `{prefix}dead` of JSON entries, pushed in failure
//! order. Paging is an `LRANGE`; `take` removes by exact value.

use async_trait::async_trait;
use redis::aio::ConnectionManager;

use super::{DeadLetterEntry, DeadLetterStore};
use crate::storage::StorageResult;

/// List-backed dead-letter store
pub struct RedisDeadLetterStore {
    redis: ConnectionManager,
    key: String,
}

impl RedisDeadLetterStore {
    /// Create a store over an existing connection; `key_prefix` is the
    /// inbox namespace, e.g. `inbox:orders:`
    pub fn new(redis: ConnectionManager, key_prefix: String) -> Self {
        Self {
            redis,
            key: format!("{key_prefix}dead"),
        }
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> StorageResult<()> {
        let data = serde_json::to_string(&entry)?;
        redis::cmd("RPUSH")
            .arg(&self.key)
            .arg(data)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    async fn page(&self, offset: u64, limit: u64) -> StorageResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let stop = offset + limit - 1;
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(offset as i64)
            .arg(stop as i64)
            .query_async(&mut self.redis.clone())
            .await?;
        raw.iter()
            .map(|data| Ok(serde_json::from_str(data)?))
            .collect()
    }

    async fn take(&self, message_id: &str) -> StorageResult<Option<DeadLetterEntry>> {
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(&self.key)
            .arg(0)
            .arg(-1)
            .query_async(&mut self.redis.clone())
            .await?;

        for data in raw {
            let entry: DeadLetterEntry = serde_json::from_str(&data)?;
            if entry.message_id == message_id {
                redis::cmd("LREM")
                    .arg(&self.key)
                    .arg(1)
                    .arg(&data)
                    .query_async::<_, ()>(&mut self.redis.clone())
                    .await?;
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn len(&self) -> StorageResult<u64> {
        let len: i64 = redis::cmd("LLEN")
            .arg(&self.key)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(len as u64)
    }
}
