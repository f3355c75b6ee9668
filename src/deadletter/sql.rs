//! PostgreSQL dead-letter store
//!
//! Mirror table `{base}_dead` with the envelope bytes plus failure
//! metadata, ordered by failure time for paging.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::{DeadLetterEntry, DeadLetterStore};
use crate::storage::StorageResult;

/// Table-backed dead-letter store
pub struct SqlDeadLetterStore {
    pool: PgPool,
    table: String,
}

impl SqlDeadLetterStore {
    /// Create a store over an existing pool; `table` must already be
    /// sanitized by the caller
    pub fn new(pool: PgPool, table: String) -> Self {
        Self { pool, table }
    }

    /// Create the backing table if missing
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                message_id TEXT PRIMARY KEY,
                envelope BYTEA NOT NULL,
                reason TEXT NOT NULL,
                failed_at TIMESTAMPTZ NOT NULL,
                final_attempt INT NOT NULL
            )",
            table = self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> StorageResult<DeadLetterEntry> {
        Ok(DeadLetterEntry {
            message_id: row.try_get("message_id")?,
            envelope: row.try_get("envelope")?,
            reason: row.try_get("reason")?,
            failed_at: row.try_get("failed_at")?,
            final_attempt: row.try_get::<i32, _>("final_attempt")? as u32,
        })
    }
}

#[async_trait]
impl DeadLetterStore for SqlDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> StorageResult<()> {
        let sql = format!(
            "INSERT INTO {table} (message_id, envelope, reason, failed_at, final_attempt)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (message_id) DO UPDATE
                SET envelope = EXCLUDED.envelope,
                    reason = EXCLUDED.reason,
                    failed_at = EXCLUDED.failed_at,
                    final_attempt = EXCLUDED.final_attempt",
            table = self.table
        );
        sqlx::query(&sql)
            .bind(&entry.message_id)
            .bind(&entry.envelope)
            .bind(&entry.reason)
            .bind(entry.failed_at)
            .bind(entry.final_attempt as i32)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn page(&self, offset: u64, limit: u64) -> StorageResult<Vec<DeadLetterEntry>> {
        let sql = format!(
            "SELECT message_id, envelope, reason, failed_at, final_attempt
             FROM {table} ORDER BY failed_at, message_id OFFSET $1 LIMIT $2",
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(offset as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::entry_from_row).collect()
    }

    async fn take(&self, message_id: &str) -> StorageResult<Option<DeadLetterEntry>> {
        let sql = format!(
            "DELETE FROM {table} WHERE message_id = $1
             RETURNING message_id, envelope, reason, failed_at, final_attempt",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn len(&self) -> StorageResult<u64> {
        let sql = format!("SELECT COUNT(*) AS total FROM {table}", table = self.table);
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }
}
