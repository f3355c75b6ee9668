//! PostgreSQL deduplication store
//!
//! One table per inbox, `{base}_dedup (key TEXT PRIMARY KEY, owner
//! TEXT, expires_at TIMESTAMPTZ)`. The primary key plus a conditional
//! upsert make `try_mark` atomic; expired rows lose to the upsert and
//! are reclaimed by `purge`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::time::Duration;

use super::{DedupOutcome, DeduplicationStore};
use crate::storage::StorageResult;

/// Unique-index deduplication store
pub struct SqlDedupStore {
    pool: PgPool,
    table: String,
}

impl SqlDedupStore {
    /// Create a store over an existing pool; `table` must already be
    /// sanitized by the caller
    pub fn new(pool: PgPool, table: String) -> Self {
        Self { pool, table }
    }

    /// Create the backing table if missing
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                key TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )",
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DeduplicationStore for SqlDedupStore {
    async fn try_mark(
        &self,
        key: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> StorageResult<DedupOutcome> {
        let now = Utc::now();
        let expires_at =
            now + ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::zero());

        // The upsert wins when the existing row is expired or already
        // ours; otherwise the row is left untouched and no row comes
        // back, which is the duplicate case.
        let sql = format!(
            "INSERT INTO {table} (key, owner, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (key) DO UPDATE
                SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at
                WHERE {table}.expires_at <= $4 OR {table}.owner = EXCLUDED.owner
             RETURNING key",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(owner_id)
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        Ok(if row.is_some() {
            DedupOutcome::Fresh
        } else {
            DedupOutcome::Duplicate
        })
    }

    async fn is_marked(&self, key: &str) -> StorageResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) AS live FROM {table} WHERE key = $1 AND expires_at > $2",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(Utc::now())
            .fetch_one(&self.pool)
            .await?;
        let live: i64 = row.try_get("live")?;
        Ok(live > 0)
    }

    async fn purge(&self, now: DateTime<Utc>) -> StorageResult<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE expires_at <= $1",
            table = self.table
        );
        let result = sqlx::query(&sql).bind(now).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}
