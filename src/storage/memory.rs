//! In-memory storage provider
//!
//! Reference implementation of the provider contract: a concurrent map
//! of envelopes plus a keyed group-lock map for FIFO mode. Suitable for
//! tests and single-process deployments; semantics are identical to the
//! SQL and Redis providers.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::{NackOutcome, StorageError, StorageProvider, StorageResult, StorageStats};
use crate::core::backoff::RetryPolicy;
use crate::core::clock::Clock;
use crate::core::envelope::{EnqueueOutcome, MessageEnvelope, MessageState};
use crate::dedup::{DedupOutcome, DeduplicationStore};
use crate::deadletter::{DeadLetterEntry, DeadLetterStore};

/// Concurrent-map storage provider
pub struct InMemoryStorageProvider {
    messages: DashMap<String, MessageEnvelope>,
    group_locks: DashMap<String, String>,
    clock: Arc<dyn Clock>,
    dedup: Arc<dyn DeduplicationStore>,
    deadletter: Arc<dyn DeadLetterStore>,
    retry: RetryPolicy,
    dedup_ttl: Duration,
    fifo: bool,
}

impl InMemoryStorageProvider {
    /// Create a provider over the given collaborators
    pub fn new(
        clock: Arc<dyn Clock>,
        dedup: Arc<dyn DeduplicationStore>,
        deadletter: Arc<dyn DeadLetterStore>,
        retry: RetryPolicy,
        dedup_ttl: Duration,
        fifo: bool,
    ) -> Self {
        Self {
            messages: DashMap::new(),
            group_locks: DashMap::new(),
            clock,
            dedup,
            deadletter,
            retry,
            dedup_ttl,
            fifo,
        }
    }

    fn horizon(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        now + ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0))
    }

    /// Snapshot of non-terminal messages in selection order
    fn snapshot_pending(&self) -> Vec<MessageEnvelope> {
        let mut pending: Vec<MessageEnvelope> = self
            .messages
            .iter()
            .filter(|entry| entry.state == MessageState::Ready)
            .map(|entry| entry.clone())
            .collect();
        pending.sort_by(|a, b| {
            a.next_visible_at
                .cmp(&b.next_visible_at)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.group_seq.cmp(&b.group_seq))
        });
        pending
    }

    /// Try to lease one message under its entry lock; returns the
    /// leased snapshot on success
    fn try_lease_one(
        &self,
        id: &str,
        now: DateTime<Utc>,
        visibility: Duration,
    ) -> Option<MessageEnvelope> {
        let mut entry = self.messages.get_mut(id)?;
        if !entry.is_visible(now) {
            return None;
        }
        entry.lease = Some(Uuid::new_v4().to_string());
        entry.next_visible_at = Self::horizon(now, visibility);
        Some(entry.clone())
    }

    /// Lease for non-FIFO mode: up to `max` visible messages in
    /// selection order, independently
    fn lease_unordered(
        &self,
        max: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Vec<MessageEnvelope> {
        let mut leased = Vec::new();
        for candidate in self.snapshot_pending() {
            if leased.len() >= max {
                break;
            }
            if !candidate.is_visible(now) {
                continue;
            }
            if let Some(message) = self.try_lease_one(&candidate.id, now, visibility) {
                leased.push(message);
            }
        }
        leased
    }

    /// Lease for FIFO mode: one maximal consecutive-seq run from a
    /// single unlocked group whose head is visible, or one ungrouped
    /// message
    fn lease_fifo(
        &self,
        max: usize,
        visibility: Duration,
        now: DateTime<Utc>,
    ) -> Vec<MessageEnvelope> {
        let pending = self.snapshot_pending();

        // Head per group: lowest pending seq
        let mut heads: Vec<&MessageEnvelope> = Vec::new();
        let mut seen_groups: HashSet<&str> = HashSet::new();
        for message in &pending {
            match message.group_id.as_deref() {
                Some(group) => {
                    if seen_groups.insert(group) {
                        let head = pending
                            .iter()
                            .filter(|m| m.group_id.as_deref() == Some(group))
                            .min_by_key(|m| m.group_seq)
                            .unwrap_or(message);
                        heads.push(head);
                    }
                }
                None => heads.push(message),
            }
        }
        heads.sort_by(|a, b| {
            a.next_visible_at
                .cmp(&b.next_visible_at)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
                .then(a.group_seq.cmp(&b.group_seq))
        });

        for head in heads {
            if !head.is_visible(now) {
                continue;
            }

            let Some(group) = head.group_id.clone() else {
                // Ungrouped messages lease independently, one at a time
                if let Some(message) = self.try_lease_one(&head.id, now, visibility) {
                    return vec![message];
                }
                continue;
            };

            // Single holder per group
            let lock_token = Uuid::new_v4().to_string();
            let locked = {
                let entry = self.group_locks.entry(group.clone());
                match entry {
                    dashmap::mapref::entry::Entry::Occupied(_) => false,
                    dashmap::mapref::entry::Entry::Vacant(vacant) => {
                        vacant.insert(lock_token);
                        true
                    }
                }
            };
            if !locked {
                continue;
            }

            // Maximal run of consecutive sequence numbers from the head
            let mut run: Vec<&MessageEnvelope> = pending
                .iter()
                .filter(|m| m.group_id.as_deref() == Some(group.as_str()))
                .collect();
            run.sort_by_key(|m| m.group_seq);

            let mut leased = Vec::new();
            let mut expected_seq = head.group_seq;
            for message in run {
                if leased.len() >= max {
                    break;
                }
                if message.group_seq != expected_seq {
                    break;
                }
                match self.try_lease_one(&message.id, now, visibility) {
                    Some(locked_message) => {
                        leased.push(locked_message);
                        expected_seq = expected_seq.map(|s| s + 1);
                    }
                    None => break,
                }
            }

            if leased.is_empty() {
                self.group_locks.remove(&group);
                continue;
            }
            return leased;
        }

        Vec::new()
    }

    /// Drop the group lock once no message of the group holds a live
    /// lease
    fn maybe_unlock_group(&self, group_id: Option<&str>, now: DateTime<Utc>) {
        let Some(group) = group_id else { return };
        let still_leased = self
            .messages
            .iter()
            .any(|m| m.group_id.as_deref() == Some(group) && m.is_leased(now));
        if !still_leased {
            self.group_locks.remove(group);
        }
    }
}

#[async_trait]
impl StorageProvider for InMemoryStorageProvider {
    async fn enqueue(&self, mut envelope: MessageEnvelope) -> StorageResult<EnqueueOutcome> {
        if envelope.id.is_empty() {
            envelope.id = Uuid::new_v4().to_string();
        }
        if self.messages.contains_key(&envelope.id) {
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

        match self.messages.entry(envelope.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(EnqueueOutcome::DuplicateId),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(envelope);
                Ok(outcome)
            }
        }
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
        let leased = if self.fifo {
            self.lease_fifo(max, visibility, now)
        } else {
            self.lease_unordered(max, visibility, now)
        };
        Ok(leased)
    }

    async fn acknowledge(&self, id: &str, lease: &str) -> StorageResult<()> {
        let now = self.clock.utc_now();
        let group_id = {
            let mut entry = self
                .messages
                .get_mut(id)
                .ok_or_else(|| StorageError::MessageNotFound(id.to_string()))?;
            if !entry.lease_matches(lease, now) {
                return Err(StorageError::LeaseExpired(id.to_string()));
            }
            entry.state = MessageState::Succeeded;
            entry.lease = None;
            entry.group_id.clone()
        };
        self.maybe_unlock_group(group_id.as_deref(), now);
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

        let (outcome, group_id, dead_entry) = {
            let mut entry = self
                .messages
                .get_mut(id)
                .ok_or_else(|| StorageError::MessageNotFound(id.to_string()))?;
            if !entry.lease_matches(lease, now) {
                return Err(StorageError::LeaseExpired(id.to_string()));
            }
            entry.attempt += 1;
            let attempt = entry.attempt;
            let group_id = entry.group_id.clone();

            if !retryable || self.retry.is_exhausted(attempt) {
                entry.state = MessageState::DeadLettered;
                entry.lease = None;
                let dead = DeadLetterEntry::from_envelope(&entry, reason, now)?;
                (
                    NackOutcome::DeadLettered {
                        final_attempt: attempt,
                    },
                    group_id,
                    Some(dead),
                )
            } else {
                let delay = self.retry.backoff.delay(attempt);
                entry.lease = None;
                entry.next_visible_at = Self::horizon(now, delay);
                (
                    NackOutcome::Rescheduled {
                        next_visible_at: entry.next_visible_at,
                        attempt,
                    },
                    group_id,
                    None,
                )
            }
        };

        if let Some(dead) = dead_entry {
            self.messages.remove(id);
            self.deadletter.append(dead).await?;
        }
        self.maybe_unlock_group(group_id.as_deref(), now);
        Ok(outcome)
    }

    async fn release(&self, id: &str, lease: &str, delay: Duration) -> StorageResult<()> {
        let now = self.clock.utc_now();
        let group_id = {
            let mut entry = self
                .messages
                .get_mut(id)
                .ok_or_else(|| StorageError::MessageNotFound(id.to_string()))?;
            if !entry.lease_matches(lease, now) {
                return Err(StorageError::LeaseExpired(id.to_string()));
            }
            entry.lease = None;
            entry.next_visible_at = Self::horizon(now, delay);
            entry.group_id.clone()
        };
        self.maybe_unlock_group(group_id.as_deref(), now);
        Ok(())
    }

    async fn extend(&self, id: &str, lease: &str, additional: Duration) -> StorageResult<()> {
        let now = self.clock.utc_now();
        let mut entry = self
            .messages
            .get_mut(id)
            .ok_or_else(|| StorageError::MessageNotFound(id.to_string()))?;
        if !entry.lease_matches(lease, now) {
            return Err(StorageError::LeaseExpired(id.to_string()));
        }
        entry.next_visible_at = Self::horizon(entry.next_visible_at, additional);
        Ok(())
    }

    async fn peek(&self, max: usize) -> StorageResult<Vec<MessageEnvelope>> {
        Ok(self.snapshot_pending().into_iter().take(max).collect())
    }

    async fn purge_terminal(&self, older_than: DateTime<Utc>) -> StorageResult<u64> {
        let before = self.messages.len();
        self.messages
            .retain(|_, m| !(m.state == MessageState::Succeeded && m.enqueued_at < older_than));
        Ok(before.saturating_sub(self.messages.len()) as u64)
    }

    async fn stats(&self) -> StorageResult<StorageStats> {
        let now = self.clock.utc_now();
        let mut stats = StorageStats::default();
        let mut groups: HashSet<String> = HashSet::new();

        for message in self.messages.iter() {
            match message.state {
                MessageState::Ready => {
                    if message.is_leased(now) {
                        stats.leased += 1;
                    } else {
                        stats.ready += 1;
                    }
                    if let Some(group) = &message.group_id {
                        groups.insert(group.clone());
                    }
                }
                MessageState::Succeeded => stats.succeeded += 1,
                MessageState::DeadLettered => stats.dead_lettered += 1,
            }
        }
        stats.dead_lettered += self.deadletter.len().await?;
        stats.groups = groups.len() as u64;
        Ok(stats)
    }
}
