//! PostgreSQL storage provider
//!
//! One message table per inbox plus a per-group lock table. Leasing
//! uses `FOR UPDATE SKIP LOCKED` so concurrent processors never block
//! each other; the lock table serializes FIFO groups across the
//! cluster. Table names are derived from the inbox name via the
//! identifier sanitizer and truncated to PostgreSQL's 63-character
//! limit.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{NackOutcome, StorageError, StorageProvider, StorageResult, StorageStats};
use crate::core::backoff::RetryPolicy;
use crate::core::clock::Clock;
use crate::core::envelope::{EnqueueOutcome, MessageEnvelope, MessageState};
use crate::core::identifier::sanitize_identifier;
use crate::dedup::{DedupOutcome, DeduplicationStore};
use crate::deadletter::{DeadLetterEntry, DeadLetterStore};

/// Longest suffix appended to the base table name (`_locks`)
const SUFFIX_HEADROOM: usize = 6;

/// Derive the per-inbox base table name: `{prefix}_{inbox}` sanitized
/// and truncated so every suffixed companion table still fits the
/// identifier limit
pub fn table_base(prefix: &str, inbox: &str) -> String {
    sanitize_identifier(
        &format!("{prefix}_{inbox}"),
        crate::core::identifier::POSTGRES_IDENTIFIER_LIMIT - SUFFIX_HEADROOM,
    )
}

/// Table-backed storage provider
pub struct SqlStorageProvider {
    pool: PgPool,
    table: String,
    locks_table: String,
    clock: Arc<dyn Clock>,
    dedup: Arc<dyn DeduplicationStore>,
    deadletter: Arc<dyn DeadLetterStore>,
    retry: RetryPolicy,
    dedup_ttl: Duration,
    fifo: bool,
}

impl SqlStorageProvider {
    /// Open a connection pool for `url`
    pub async fn connect(url: &str) -> StorageResult<PgPool> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(16)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await?;
        Ok(pool)
    }

    /// Create a provider over an existing pool
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        base_table: String,
        clock: Arc<dyn Clock>,
        dedup: Arc<dyn DeduplicationStore>,
        deadletter: Arc<dyn DeadLetterStore>,
        retry: RetryPolicy,
        dedup_ttl: Duration,
        fifo: bool,
    ) -> Self {
        Self {
            pool,
            locks_table: format!("{base_table}_locks"),
            table: base_table,
            clock,
            dedup,
            deadletter,
            retry,
            dedup_ttl,
            fifo,
        }
    }

    /// Create the message and lock tables if missing
    pub async fn ensure_schema(&self) -> StorageResult<()> {
        let messages = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                dedup_key TEXT NULL,
                group_id TEXT NULL,
                seq BIGINT NULL,
                payload BYTEA NOT NULL,
                content_type TEXT NOT NULL,
                enqueued_at TIMESTAMPTZ NOT NULL,
                attempt INT NOT NULL DEFAULT 0,
                next_visible_at TIMESTAMPTZ NOT NULL,
                lease TEXT NULL,
                state SMALLINT NOT NULL DEFAULT 0
            )",
            table = self.table
        );
        let visibility_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_vis_idx
                ON {table} (state, next_visible_at)",
            table = self.table
        );
        let group_index = format!(
            "CREATE INDEX IF NOT EXISTS {table}_grp_idx
                ON {table} (group_id, seq)",
            table = self.table
        );
        let locks = format!(
            "CREATE TABLE IF NOT EXISTS {locks} (
                group_id TEXT PRIMARY KEY,
                lease TEXT NULL,
                locked_until TIMESTAMPTZ NULL
            )",
            locks = self.locks_table
        );

        sqlx::query(&messages).execute(&self.pool).await?;
        sqlx::query(&visibility_index).execute(&self.pool).await?;
        sqlx::query(&group_index).execute(&self.pool).await?;
        sqlx::query(&locks).execute(&self.pool).await?;
        Ok(())
    }

    fn envelope_from_row(row: &PgRow) -> StorageResult<MessageEnvelope> {
        let state_raw: i16 = row.try_get("state")?;
        let state = MessageState::from_i16(state_raw)
            .ok_or_else(|| StorageError::Schema(format!("unknown message state {state_raw}")))?;
        Ok(MessageEnvelope {
            id: row.try_get("id")?,
            dedup_key: row.try_get("dedup_key")?,
            group_id: row.try_get("group_id")?,
            group_seq: row.try_get("seq")?,
            payload: row.try_get("payload")?,
            content_type: row.try_get("content_type")?,
            enqueued_at: row.try_get("enqueued_at")?,
            attempt: row.try_get::<i32, _>("attempt")? as u32,
            next_visible_at: row.try_get("next_visible_at")?,
            lease: row.try_get("lease")?,
            state,
        })
    }

    fn select_columns() -> &'static str {
        "id, dedup_key, group_id, seq, payload, content_type, enqueued_at, \
         attempt, next_visible_at, lease, state"
    }

    fn horizon(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        now + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::zero())
    }

    /// Assign a fresh lease to one selected row inside `tx`
    async fn lease_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        table: &str,
        id: &str,
        horizon: DateTime<Utc>,
    ) -> StorageResult<Option<MessageEnvelope>> {
        let token = Uuid::new_v4().to_string();
        let sql = format!(
            "UPDATE {table} SET lease = $1, next_visible_at = $2 WHERE id = $3
             RETURNING {columns}",
            table = table,
            columns = Self::select_columns()
        );
        let row = sqlx::query(&sql)
            .bind(&token)
            .bind(horizon)
            .bind(id)
            .fetch_optional(&mut **tx)
            .await?;
        row.as_ref().map(Self::envelope_from_row).transpose()
    }

    async fn lease_unordered(
        &self,
        max: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MessageEnvelope>> {
        let mut tx = self.pool.begin().await?;
        let select = format!(
            "SELECT id FROM {table}
             WHERE state = 0 AND next_visible_at <= $1
             ORDER BY next_visible_at, enqueued_at, seq
             LIMIT $2
             FOR UPDATE SKIP LOCKED",
            table = self.table
        );
        let rows = sqlx::query(&select)
            .bind(now)
            .bind(max as i64)
            .fetch_all(&mut *tx)
            .await?;

        let horizon = Self::horizon(now, visibility);
        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            if let Some(message) = Self::lease_row(&mut tx, &self.table, &id, horizon).await? {
                leased.push(message);
            }
        }
        tx.commit().await?;
        Ok(leased)
    }

    async fn lease_fifo(
        &self,
        max: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MessageEnvelope>> {
        let mut tx = self.pool.begin().await?;
        let horizon = Self::horizon(now, visibility);

        // Take the lock row of the best candidate group: unlocked, with
        // a visible head (lowest pending seq)
        let pick_group = format!(
            "SELECT l.group_id FROM {locks} l
             WHERE (l.locked_until IS NULL OR l.locked_until <= $1)
               AND EXISTS (
                   SELECT 1 FROM {table} m
                   WHERE m.group_id = l.group_id
                     AND m.state = 0
                     AND m.next_visible_at <= $1
                     AND m.seq = (
                         SELECT MIN(h.seq) FROM {table} h
                         WHERE h.group_id = l.group_id AND h.state = 0
                     )
               )
             ORDER BY (
                 SELECT MIN(m2.next_visible_at) FROM {table} m2
                 WHERE m2.group_id = l.group_id AND m2.state = 0
             )
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
            locks = self.locks_table,
            table = self.table
        );
        let group_row = sqlx::query(&pick_group)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(group_row) = group_row {
            let group_id: String = group_row.try_get("group_id")?;
            let lock_token = Uuid::new_v4().to_string();
            let take_lock = format!(
                "UPDATE {locks} SET lease = $1, locked_until = $2 WHERE group_id = $3",
                locks = self.locks_table
            );
            sqlx::query(&take_lock)
                .bind(&lock_token)
                .bind(horizon)
                .bind(&group_id)
                .execute(&mut *tx)
                .await?;

            let pending = format!(
                "SELECT {columns} FROM {table}
                 WHERE group_id = $1 AND state = 0
                 ORDER BY seq",
                columns = Self::select_columns(),
                table = self.table
            );
            let rows = sqlx::query(&pending)
                .bind(&group_id)
                .fetch_all(&mut *tx)
                .await?;

            // Maximal run of consecutive sequence numbers from the head
            let mut leased = Vec::new();
            let mut expected_seq: Option<i64> = None;
            for row in &rows {
                if leased.len() >= max {
                    break;
                }
                let message = Self::envelope_from_row(row)?;
                if let Some(expected) = expected_seq {
                    if message.group_seq != Some(expected) {
                        break;
                    }
                }
                if !message.is_visible(now) {
                    break;
                }
                let Some(locked) =
                    Self::lease_row(&mut tx, &self.table, &message.id, horizon).await?
                else {
                    break;
                };
                expected_seq = message.group_seq.map(|s| s + 1);
                leased.push(locked);
            }

            if leased.is_empty() {
                let drop_lock = format!(
                    "UPDATE {locks} SET lease = NULL, locked_until = NULL WHERE group_id = $1",
                    locks = self.locks_table
                );
                sqlx::query(&drop_lock)
                    .bind(&group_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            return Ok(leased);
        }

        // No leasable group; serve one ungrouped message instead
        let ungrouped = format!(
            "SELECT id FROM {table}
             WHERE state = 0 AND group_id IS NULL AND next_visible_at <= $1
             ORDER BY next_visible_at, enqueued_at
             LIMIT 1
             FOR UPDATE SKIP LOCKED",
            table = self.table
        );
        let row = sqlx::query(&ungrouped)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

        let mut leased = Vec::new();
        if let Some(row) = row {
            let id: String = row.try_get("id")?;
            if let Some(message) = Self::lease_row(&mut tx, &self.table, &id, horizon).await? {
                leased.push(message);
            }
        }
        tx.commit().await?;
        Ok(leased)
    }

    /// Release the group lock once no live lease remains in the group
    async fn maybe_unlock_group(
        &self,
        group_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let Some(group_id) = group_id else {
            return Ok(());
        };
        let sql = format!(
            "UPDATE {locks} SET lease = NULL, locked_until = NULL
             WHERE group_id = $1
               AND NOT EXISTS (
                   SELECT 1 FROM {table} m
                   WHERE m.group_id = $1
                     AND m.state = 0
                     AND m.lease IS NOT NULL
                     AND m.next_visible_at > $2
               )",
            locks = self.locks_table,
            table = self.table
        );
        sqlx::query(&sql)
            .bind(group_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch a row and validate the caller's lease
    async fn fetch_checked(
        &self,
        id: &str,
        lease: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<MessageEnvelope> {
        let sql = format!(
            "SELECT {columns} FROM {table} WHERE id = $1",
            columns = Self::select_columns(),
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::MessageNotFound(id.to_string()))?;
        let message = Self::envelope_from_row(&row)?;
        if !message.lease_matches(lease, now) {
            return Err(StorageError::LeaseExpired(id.to_string()));
        }
        Ok(message)
    }
}

#[async_trait]
impl StorageProvider for SqlStorageProvider {
    async fn enqueue(&self, mut envelope: MessageEnvelope) -> StorageResult<EnqueueOutcome> {
        if envelope.id.is_empty() {
            envelope.id = Uuid::new_v4().to_string();
        }
        let now = self.clock.utc_now();
        envelope.enqueued_at = now;
        envelope.next_visible_at = now;
        envelope.lease = None;

        let mut outcome = EnqueueOutcome::Accepted;
        if let Some(key) = envelope.dedup_key.clone() {
            if self.dedup.try_mark(&key, &envelope.id, self.dedup_ttl).await?
                == DedupOutcome::Duplicate
            {
                envelope.state = MessageState::Succeeded;
                outcome = EnqueueOutcome::DedupHit;
            }
        }

        let insert = format!(
            "INSERT INTO {table}
                (id, dedup_key, group_id, seq, payload, content_type,
                 enqueued_at, attempt, next_visible_at, lease, state)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, $10)
             ON CONFLICT (id) DO NOTHING",
            table = self.table
        );
        let result = sqlx::query(&insert)
            .bind(&envelope.id)
            .bind(&envelope.dedup_key)
            .bind(&envelope.group_id)
            .bind(envelope.group_seq)
            .bind(&envelope.payload)
            .bind(&envelope.content_type)
            .bind(envelope.enqueued_at)
            .bind(envelope.attempt as i32)
            .bind(envelope.next_visible_at)
            .bind(envelope.state as i16)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(EnqueueOutcome::DuplicateId);
        }

        if let Some(group_id) = &envelope.group_id {
            let lock_row = format!(
                "INSERT INTO {locks} (group_id) VALUES ($1) ON CONFLICT (group_id) DO NOTHING",
                locks = self.locks_table
            );
            sqlx::query(&lock_row)
                .bind(group_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(outcome)
    }

    async fn lease_batch(
        &self,
        max: usize,
        visibility: Duration,
    ) -> StorageResult<Vec<MessageEnvelope>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.utc_now();
        if self.fifo {
            self.lease_fifo(max, visibility, now).await
        } else {
            self.lease_unordered(max, visibility, now).await
        }
    }

    async fn acknowledge(&self, id: &str, lease: &str) -> StorageResult<()> {
        let now = self.clock.utc_now();
        let sql = format!(
            "UPDATE {table} SET state = 1, lease = NULL
             WHERE id = $1 AND lease = $2 AND state = 0 AND next_visible_at > $3
             RETURNING group_id",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .bind(lease)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::LeaseExpired(id.to_string()))?;

        if self.fifo {
            let group_id: Option<String> = row.try_get("group_id")?;
            self.maybe_unlock_group(group_id.as_deref(), now).await?;
        }
        Ok(())
    }

    async fn nack(
        &self,
        id: &str,
        lease: &str,
        reason: &str,
        retryable: bool,
    ) -> StorageResult<NackOutcome> {
        let now = self.clock.utc_now();
        let mut message = self.fetch_checked(id, lease, now).await?;
        message.attempt += 1;
        let attempt = message.attempt;
        let group_id = message.group_id.clone();

        let outcome = if !retryable || self.retry.is_exhausted(attempt) {
            // Copy to the dead-letter store first so a crash between
            // the two writes redelivers instead of losing the message
            message.state = MessageState::DeadLettered;
            message.lease = None;
            self.deadletter
                .append(DeadLetterEntry::from_envelope(&message, reason, now)?)
                .await?;

            let delete = format!(
                "DELETE FROM {table} WHERE id = $1 AND lease = $2",
                table = self.table
            );
            let result = sqlx::query(&delete)
                .bind(id)
                .bind(lease)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StorageError::LeaseExpired(id.to_string()));
            }
            NackOutcome::DeadLettered {
                final_attempt: attempt,
            }
        } else {
            let next_visible_at = Self::horizon(now, self.retry.backoff.delay(attempt));
            let update = format!(
                "UPDATE {table} SET attempt = $1, lease = NULL, next_visible_at = $2
                 WHERE id = $3 AND lease = $4",
                table = self.table
            );
            let result = sqlx::query(&update)
                .bind(attempt as i32)
                .bind(next_visible_at)
                .bind(id)
                .bind(lease)
                .execute(&self.pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(StorageError::LeaseExpired(id.to_string()));
            }
            NackOutcome::Rescheduled {
                next_visible_at,
                attempt,
            }
        };

        if self.fifo {
            self.maybe_unlock_group(group_id.as_deref(), now).await?;
        }
        Ok(outcome)
    }

    async fn release(&self, id: &str, lease: &str, delay: Duration) -> StorageResult<()> {
        let now = self.clock.utc_now();
        let next_visible_at = Self::horizon(now, delay);
        let sql = format!(
            "UPDATE {table} SET lease = NULL, next_visible_at = $1
             WHERE id = $2 AND lease = $3 AND state = 0 AND next_visible_at > $4
             RETURNING group_id",
            table = self.table
        );
        let row = sqlx::query(&sql)
            .bind(next_visible_at)
            .bind(id)
            .bind(lease)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::LeaseExpired(id.to_string()))?;

        if self.fifo {
            let group_id: Option<String> = row.try_get("group_id")?;
            self.maybe_unlock_group(group_id.as_deref(), now).await?;
        }
        Ok(())
    }

    async fn extend(&self, id: &str, lease: &str, additional: Duration) -> StorageResult<()> {
        let now = self.clock.utc_now();
        let sql = format!(
            "UPDATE {table}
             SET next_visible_at = next_visible_at + make_interval(secs => $1)
             WHERE id = $2 AND lease = $3 AND state = 0 AND next_visible_at > $4",
            table = self.table
        );
        let result = sqlx::query(&sql)
            .bind(additional.as_secs_f64())
            .bind(id)
            .bind(lease)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::LeaseExpired(id.to_string()));
        }

        if self.fifo {
            // Keep the group lock alive alongside the message lease
            let sql = format!(
                "UPDATE {locks} SET locked_until = locked_until + make_interval(secs => $1)
                 WHERE group_id = (SELECT group_id FROM {table} WHERE id = $2)",
                locks = self.locks_table,
                table = self.table
            );
            sqlx::query(&sql)
                .bind(additional.as_secs_f64())
                .bind(id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn peek(&self, max: usize) -> StorageResult<Vec<MessageEnvelope>> {
        let sql = format!(
            "SELECT {columns} FROM {table}
             WHERE state = 0
             ORDER BY next_visible_at, enqueued_at, seq
             LIMIT $1",
            columns = Self::select_columns(),
            table = self.table
        );
        let rows = sqlx::query(&sql)
            .bind(max as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::envelope_from_row).collect()
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let sql = format!(
            "DELETE FROM {table} WHERE state = 1 AND enqueued_at < $1",
            table = self.table
        );
        let result = sqlx::query(&sql).bind(older_than).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let now = self.clock.utc_now();
        let sql = format!(
            "SELECT
                COUNT(*) FILTER (WHERE state = 0
                    AND (lease IS NULL OR next_visible_at <= $1)) AS ready,
                COUNT(*) FILTER (WHERE state = 0
                    AND lease IS NOT NULL AND next_visible_at > $1) AS leased,
                COUNT(*) FILTER (WHERE state = 1) AS succeeded,
                COUNT(DISTINCT group_id) FILTER (WHERE state = 0) AS groups
             FROM {table}",
            table = self.table
        );
        let row = sqlx::query(&sql).bind(now).fetch_one(&self.pool).await?;
        Ok(StorageStats {
            ready: row.try_get::<i64, _>("ready")? as u64,
            leased: row.try_get::<i64, _>("leased")? as u64,
            succeeded: row.try_get::<i64, _>("succeeded")? as u64,
            dead_lettered: self.deadletter.len().await?,
            groups: row.try_get::<i64, _>("groups")? as u64,
        })
    }
}
