//! Redis storage provider
//!
//! Key layout per inbox (`{p}` = `inbox:{name}:`):
//!
//! - `{p}pending` — sorted set of message ids scored by `next_visible_at` (ms)
//! - `{p}msg:{id}` — hash holding the JSON envelope
//! - `{p}done` — sorted set of terminal successes scored by `enqueued_at` (ms)
//! - `{p}groups` — set of known group ids
//! - `{p}group:{g}` — list of message ids belonging to the group
//! - `{p}lock:{g}` — group lock string with a PX TTL spanning the lease
//!
//! The dedup (`{p}dedup:{key}`) and dead-letter (`{p}dead`) keys belong
//! to their companion stores.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{NackOutcome, StorageError, StorageProvider, StorageResult, StorageStats};
use crate::core::backoff::RetryPolicy;
use crate::core::clock::Clock;
use crate::core::envelope::{EnqueueOutcome, MessageEnvelope, MessageState};
use crate::dedup::{DedupOutcome, DeduplicationStore};
use crate::deadletter::{DeadLetterEntry, DeadLetterStore};

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Sorted-set storage provider
pub struct RedisStorageProvider {
    redis: ConnectionManager,
    prefix: String,
    clock: Arc<dyn Clock>,
    dedup: Arc<dyn DeduplicationStore>,
    deadletter: Arc<dyn DeadLetterStore>,
    retry: RetryPolicy,
    dedup_ttl: Duration,
    fifo: bool,
}

impl RedisStorageProvider {
    /// Open a managed connection for `url`
    pub async fn connect(url: &str) -> StorageResult<ConnectionManager> {
        let client = redis::Client::open(url)?;
        Ok(ConnectionManager::new(client).await?)
    }

    /// Create a provider over an existing connection; `prefix` is the
    /// inbox namespace, e.g. `inbox:orders:`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: ConnectionManager,
        prefix: String,
        clock: Arc<dyn Clock>,
        dedup: Arc<dyn DeduplicationStore>,
        deadletter: Arc<dyn DeadLetterStore>,
        retry: RetryPolicy,
        dedup_ttl: Duration,
        fifo: bool,
    ) -> Self {
        Self {
            redis,
            prefix,
            clock,
            dedup,
            deadletter,
            retry,
            dedup_ttl,
            fifo,
        }
    }

    fn pending_key(&self) -> String {
        format!("{}pending", self.prefix)
    }

    fn done_key(&self) -> String {
        format!("{}done", self.prefix)
    }

    fn msg_key(&self, id: &str) -> String {
        format!("{}msg:{}", self.prefix, id)
    }

    fn groups_key(&self) -> String {
        format!("{}groups", self.prefix)
    }

    fn group_key(&self, group: &str) -> String {
        format!("{}group:{}", self.prefix, group)
    }

    fn lock_key(&self, group: &str) -> String {
        format!("{}lock:{}", self.prefix, group)
    }

    fn horizon(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        now + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0))
    }

    async fn load(&self, id: &str) -> StorageResult<Option<MessageEnvelope>> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.msg_key(id))
            .arg("envelope")
            .query_async(&mut self.redis.clone())
            .await?;
        raw.map(|data| Ok(serde_json::from_str(&data)?)).transpose()
    }

    async fn store(&self, envelope: &MessageEnvelope) -> StorageResult<()> {
        let data = serde_json::to_string(envelope)?;
        redis::cmd("HSET")
            .arg(self.msg_key(&envelope.id))
            .arg("envelope")
            .arg(data)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    /// Re-score a pending message by its visibility horizon
    async fn reschedule(&self, envelope: &MessageEnvelope) -> StorageResult<()> {
        redis::cmd("ZADD")
            .arg(self.pending_key())
            .arg("XX")
            .arg(millis(envelope.next_visible_at))
            .arg(&envelope.id)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;
        Ok(())
    }

    /// Drop a message from the pending index and its group list
    async fn remove_from_queue(&self, envelope: &MessageEnvelope) -> StorageResult<()> {
        redis::cmd("ZREM")
            .arg(self.pending_key())
            .arg(&envelope.id)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;
        if let Some(group) = &envelope.group_id {
            redis::cmd("LREM")
                .arg(self.group_key(group))
                .arg(1)
                .arg(&envelope.id)
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
        }
        Ok(())
    }

    /// Pending envelopes of one group, sorted by sequence number
    async fn group_pending(&self, group: &str) -> StorageResult<Vec<MessageEnvelope>> {
        let ids: Vec<String> = redis::cmd("LRANGE")
            .arg(self.group_key(group))
            .arg(0)
            .arg(-1)
            .query_async(&mut self.redis.clone())
            .await?;

        let mut members = Vec::new();
        for id in ids {
            if let Some(envelope) = self.load(&id).await? {
                if envelope.state == MessageState::Ready {
                    members.push(envelope);
                }
            }
        }
        members.sort_by_key(|m| m.group_seq);
        Ok(members)
    }

    async fn try_lock_group(&self, group: &str, visibility: Duration) -> StorageResult<bool> {
        let token = Uuid::new_v4().to_string();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(group))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(visibility.as_millis().max(1) as u64)
            .query_async(&mut self.redis.clone())
            .await?;
        Ok(acquired.is_some())
    }

    /// Drop the group lock once no live lease remains in the group
    async fn maybe_unlock_group(
        &self,
        group_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> StorageResult<()> {
        let Some(group) = group_id else { return Ok(()) };
        let still_leased = self
            .group_pending(group)
            .await?
            .iter()
            .any(|m| m.is_leased(now));
        if !still_leased {
            redis::cmd("DEL")
                .arg(self.lock_key(group))
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
        }
        Ok(())
    }

    async fn lease_one(
        &self,
        mut envelope: MessageEnvelope,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> StorageResult<MessageEnvelope> {
        envelope.lease = Some(Uuid::new_v4().to_string());
        envelope.next_visible_at = Self::horizon(now, visibility);
        self.store(&envelope).await?;
        self.reschedule(&envelope).await?;
        Ok(envelope)
    }

    async fn lease_unordered(
        &self,
        max: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MessageEnvelope>> {
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.pending_key())
            .arg("-inf")
            .arg(millis(now))
            .arg("LIMIT")
            .arg(0)
            .arg(max as i64)
            .query_async(&mut self.redis.clone())
            .await?;

        let mut leased = Vec::new();
        for id in ids {
            if leased.len() >= max {
                break;
            }
            let Some(envelope) = self.load(&id).await? else {
                // Orphaned index entry
                redis::cmd("ZREM")
                    .arg(self.pending_key())
                    .arg(&id)
                    .query_async::<_, ()>(&mut self.redis.clone())
                    .await?;
                continue;
            };
            if !envelope.is_visible(now) {
                continue;
            }
            leased.push(self.lease_one(envelope, now, visibility).await?);
        }
        Ok(leased)
    }

    async fn lease_fifo(
        &self,
        max: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<MessageEnvelope>> {
        let groups: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.groups_key())
            .query_async(&mut self.redis.clone())
            .await?;

        // Order candidate groups by their head's visibility horizon
        let mut candidates: Vec<(DateTime<Utc>, String, Vec<MessageEnvelope>)> = Vec::new();
        for group in groups {
            let pending = self.group_pending(&group).await?;
            let Some(head) = pending.first() else { continue };
            if head.is_visible(now) {
                candidates.push((head.next_visible_at, group, pending));
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        for (_, group, pending) in candidates {
            if !self.try_lock_group(&group, visibility).await? {
                continue;
            }

            // Maximal visible run of consecutive sequence numbers
            // from the head
            let mut leased = Vec::new();
            let mut expected_seq = pending.first().and_then(|m| m.group_seq);
            for envelope in pending {
                if leased.len() >= max {
                    break;
                }
                if envelope.group_seq != expected_seq || !envelope.is_visible(now) {
                    break;
                }
                expected_seq = envelope.group_seq.map(|s| s + 1);
                leased.push(self.lease_one(envelope, now, visibility).await?);
            }

            if leased.is_empty() {
                redis::cmd("DEL")
                    .arg(self.lock_key(&group))
                    .query_async::<_, ()>(&mut self.redis.clone())
                    .await?;
                continue;
            }
            return Ok(leased);
        }

        // No leasable group; serve one ungrouped message instead
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.pending_key())
            .arg("-inf")
            .arg(millis(now))
            .arg("LIMIT")
            .arg(0)
            .arg(32)
            .query_async(&mut self.redis.clone())
            .await?;
        for id in ids {
            let Some(envelope) = self.load(&id).await? else {
                continue;
            };
            if envelope.group_id.is_none() && envelope.is_visible(now) {
                return Ok(vec![self.lease_one(envelope, now, visibility).await?]);
            }
        }
        Ok(Vec::new())
    }

    /// Load a message and validate the caller's lease
    async fn load_checked(
        &self,
        id: &str,
        lease: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<MessageEnvelope> {
        let envelope = self
            .load(id)
            .await?
            .ok_or_else(|| StorageError::MessageNotFound(id.to_string()))?;
        if !envelope.lease_matches(lease, now) {
            return Err(StorageError::LeaseExpired(id.to_string()));
        }
        Ok(envelope)
    }
}

#[async_trait]
impl StorageProvider for RedisStorageProvider {
    async fn enqueue(&self, mut envelope: MessageEnvelope) -> StorageResult<EnqueueOutcome> {
        if envelope.id.is_empty() {
            envelope.id = Uuid::new_v4().to_string();
        }
        let exists: i64 = redis::cmd("EXISTS")
            .arg(self.msg_key(&envelope.id))
            .query_async(&mut self.redis.clone())
            .await?;
        if exists > 0 {
            return Ok(EnqueueOutcome::DuplicateId);
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

        self.store(&envelope).await?;

        if envelope.state == MessageState::Succeeded {
            redis::cmd("ZADD")
                .arg(self.done_key())
                .arg(millis(envelope.enqueued_at))
                .arg(&envelope.id)
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
            return Ok(outcome);
        }

        redis::cmd("ZADD")
            .arg(self.pending_key())
            .arg(millis(envelope.next_visible_at))
            .arg(&envelope.id)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;

        if let Some(group) = &envelope.group_id {
            redis::cmd("SADD")
                .arg(self.groups_key())
                .arg(group)
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
            redis::cmd("RPUSH")
                .arg(self.group_key(group))
                .arg(&envelope.id)
                .query_async::<_, ()>(&mut self.redis.clone())
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
        let mut envelope = self.load_checked(id, lease, now).await?;
        envelope.state = MessageState::Succeeded;
        envelope.lease = None;

        self.store(&envelope).await?;
        self.remove_from_queue(&envelope).await?;
        redis::cmd("ZADD")
            .arg(self.done_key())
            .arg(millis(envelope.enqueued_at))
            .arg(&envelope.id)
            .query_async::<_, ()>(&mut self.redis.clone())
            .await?;

        if self.fifo {
            self.maybe_unlock_group(envelope.group_id.as_deref(), now)
                .await?;
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
        let mut envelope = self.load_checked(id, lease, now).await?;
        envelope.attempt += 1;
        let attempt = envelope.attempt;
        let group_id = envelope.group_id.clone();

        let outcome = if !retryable || self.retry.is_exhausted(attempt) {
            envelope.state = MessageState::DeadLettered;
            envelope.lease = None;
            // Copy out before removal so a crash redelivers rather
            // than loses the message
            self.deadletter
                .append(DeadLetterEntry::from_envelope(&envelope, reason, now)?)
                .await?;
            self.remove_from_queue(&envelope).await?;
            redis::cmd("DEL")
                .arg(self.msg_key(id))
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
            NackOutcome::DeadLettered {
                final_attempt: attempt,
            }
        } else {
            envelope.lease = None;
            envelope.next_visible_at = Self::horizon(now, self.retry.backoff.delay(attempt));
            self.store(&envelope).await?;
            self.reschedule(&envelope).await?;
            NackOutcome::Rescheduled {
                next_visible_at: envelope.next_visible_at,
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
        let mut envelope = self.load_checked(id, lease, now).await?;
        envelope.lease = None;
        envelope.next_visible_at = Self::horizon(now, delay);

        self.store(&envelope).await?;
        self.reschedule(&envelope).await?;

        if self.fifo {
            self.maybe_unlock_group(envelope.group_id.as_deref(), now)
                .await?;
        }
        Ok(())
    }

    async fn extend(&self, id: &str, lease: &str, additional: Duration) -> StorageResult<()> {
        let now = self.clock.utc_now();
        let mut envelope = self.load_checked(id, lease, now).await?;
        envelope.next_visible_at = Self::horizon(envelope.next_visible_at, additional);

        self.store(&envelope).await?;
        self.reschedule(&envelope).await?;

        if let Some(group) = &envelope.group_id {
            let remaining = (envelope.next_visible_at - now).num_milliseconds().max(1);
            redis::cmd("PEXPIRE")
                .arg(self.lock_key(group))
                .arg(remaining)
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
        }
        Ok(())
    }

    async fn peek(&self, max: usize) -> StorageResult<Vec<MessageEnvelope>> {
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.pending_key())
            .arg(0)
            .arg(max.saturating_sub(1) as i64)
            .query_async(&mut self.redis.clone())
            .await?;

        let mut messages = Vec::new();
        for id in ids {
            if let Some(envelope) = self.load(&id).await? {
                if envelope.state == MessageState::Ready {
                    messages.push(envelope);
                }
            }
        }
        Ok(messages)
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.done_key())
            .arg("-inf")
            .arg(millis(older_than) - 1)
            .query_async(&mut self.redis.clone())
            .await?;

        let mut purged = 0;
        for id in ids {
            redis::cmd("DEL")
                .arg(self.msg_key(&id))
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
            redis::cmd("ZREM")
                .arg(self.done_key())
                .arg(&id)
                .query_async::<_, ()>(&mut self.redis.clone())
                .await?;
            purged += 1;
        }
        Ok(purged)
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let now = self.clock.utc_now();
        let ids: Vec<String> = redis::cmd("ZRANGE")
            .arg(self.pending_key())
            .arg(0)
            .arg(-1)
            .query_async(&mut self.redis.clone())
            .await?;

        let mut stats = StorageStats::default();
        let mut groups = std::collections::HashSet::new();
        for id in ids {
            let Some(envelope) = self.load(&id).await? else {
                continue;
            };
            if envelope.state != MessageState::Ready {
                continue;
            }
            if envelope.is_leased(now) {
                stats.leased += 1;
            } else {
                stats.ready += 1;
            }
            if let Some(group) = envelope.group_id {
                groups.insert(group);
            }
        }

        let succeeded: i64 = redis::cmd("ZCARD")
            .arg(self.done_key())
            .query_async(&mut self.redis.clone())
            .await?;
        stats.succeeded = succeeded as u64;
        stats.dead_lettered = self.deadletter.len().await?;
        stats.groups = groups.len() as u64;
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_millis_roundtrip() {
        let at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();
        assert_eq!(millis(at), 1_700_000_000_123);
    }
}
