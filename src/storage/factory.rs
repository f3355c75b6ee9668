//! Storage provider factory
//!
//! Selects the provider variant for an inbox configuration and builds
//! the per-inbox resource bundle (storage + dedup + dead-letter). The
//! bundles are cached in a concurrent map keyed by inbox name with
//! get-or-insert atomicity, so unrelated inboxes never serialize on a
//! shared lock.

use dashmap::DashMap;
use std::sync::Arc;

use super::memory::InMemoryStorageProvider;
use super::redis::RedisStorageProvider;
use super::sql::{table_base, SqlStorageProvider};
use super::{StorageProvider, StorageResult};
use crate::config::{BackendConfig, InboxConfig};
use crate::core::clock::Clock;
use crate::core::identifier::sanitize_identifier;
use crate::dedup::{DeduplicationStore, InMemoryDedupStore, RedisDedupStore, SqlDedupStore};
use crate::deadletter::{
    DeadLetterStore, InMemoryDeadLetterStore, RedisDeadLetterStore, SqlDeadLetterStore,
};

/// The storage collaborators of one inbox
pub struct InboxResources {
    /// Durable queue
    pub storage: Arc<dyn StorageProvider>,
    /// Deduplication store
    pub dedup: Arc<dyn DeduplicationStore>,
    /// Dead-letter store
    pub deadletter: Arc<dyn DeadLetterStore>,
}

/// Builds and caches per-inbox resources
pub struct ProviderFactory {
    clock: Arc<dyn Clock>,
    resources: DashMap<String, Arc<InboxResources>>,
}

impl ProviderFactory {
    /// Create a factory reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            resources: DashMap::new(),
        }
    }

    /// Resources for the inbox, building them on first use
    pub async fn resources_for(&self, config: &InboxConfig) -> StorageResult<Arc<InboxResources>> {
        if let Some(existing) = self.resources.get(&config.name) {
            return Ok(existing.clone());
        }

        let built = Arc::new(self.build(config).await?);
        // A concurrent builder may have won the race; the map keeps
        // exactly one bundle per inbox either way
        let entry = self
            .resources
            .entry(config.name.clone())
            .or_insert(built)
            .clone();
        Ok(entry)
    }

    /// Resources for an already-built inbox, if any
    pub fn get(&self, name: &str) -> Option<Arc<InboxResources>> {
        self.resources.get(name).map(|r| r.clone())
    }

    async fn build(&self, config: &InboxConfig) -> StorageResult<InboxResources> {
        let fifo = config.inbox_type.is_fifo();
        match &config.backend {
            BackendConfig::Memory => {
                let dedup: Arc<dyn DeduplicationStore> =
                    Arc::new(InMemoryDedupStore::new(self.clock.clone()));
                let deadletter: Arc<dyn DeadLetterStore> = Arc::new(InMemoryDeadLetterStore::new());
                let storage: Arc<dyn StorageProvider> = Arc::new(InMemoryStorageProvider::new(
                    self.clock.clone(),
                    dedup.clone(),
                    deadletter.clone(),
                    config.retry.clone(),
                    config.dedup_ttl,
                    fifo,
                ));
                Ok(InboxResources {
                    storage,
                    dedup,
                    deadletter,
                })
            }
            BackendConfig::Sql { url, table_prefix } => {
                let pool = SqlStorageProvider::connect(url).await?;
                let base = table_base(table_prefix, &config.name);

                let dedup_store = SqlDedupStore::new(pool.clone(), format!("{base}_dedup"));
                dedup_store.ensure_schema().await?;
                let dedup: Arc<dyn DeduplicationStore> = Arc::new(dedup_store);

                let dead_store = SqlDeadLetterStore::new(pool.clone(), format!("{base}_dead"));
                dead_store.ensure_schema().await?;
                let deadletter: Arc<dyn DeadLetterStore> = Arc::new(dead_store);

                let provider = SqlStorageProvider::new(
                    pool,
                    base,
                    self.clock.clone(),
                    dedup.clone(),
                    deadletter.clone(),
                    config.retry.clone(),
                    config.dedup_ttl,
                    fifo,
                );
                provider.ensure_schema().await?;
                Ok(InboxResources {
                    storage: Arc::new(provider),
                    dedup,
                    deadletter,
                })
            }
            BackendConfig::Redis { url } => {
                let redis = RedisStorageProvider::connect(url).await?;
                let prefix = format!("inbox:{}:", sanitize_identifier(&config.name, 63));

                let dedup: Arc<dyn DeduplicationStore> =
                    Arc::new(RedisDedupStore::new(redis.clone(), prefix.clone()));
                let deadletter: Arc<dyn DeadLetterStore> =
                    Arc::new(RedisDeadLetterStore::new(redis.clone(), prefix.clone()));

                let storage: Arc<dyn StorageProvider> = Arc::new(RedisStorageProvider::new(
                    redis,
                    prefix,
                    self.clock.clone(),
                    dedup.clone(),
                    deadletter.clone(),
                    config.retry.clone(),
                    config.dedup_ttl,
                    fifo,
                ));
                Ok(InboxResources {
                    storage,
                    dedup,
                    deadletter,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::SystemClock;

    #[tokio::test]
    async fn test_memory_resources_cached_per_inbox() {
        let factory = ProviderFactory::new(Arc::new(SystemClock));
        let config = InboxConfig::new("orders");

        let first = factory.resources_for(&config).await.unwrap();
        let second = factory.resources_for(&config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let other = factory
            .resources_for(&InboxConfig::new("payments"))
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert!(factory.get("orders").is_some());
        assert!(factory.get("missing").is_none());
    }
}
