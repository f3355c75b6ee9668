//! Dead-letter store
//!
//! Append-only log of permanently failed messages, keyed by message id
//! within an inbox. Entries carry the serialized envelope, the terminal
//! failure reason, the failure timestamp, and the final attempt count.
//! Entries can be paged for inspection and taken back out for manual
//! replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::envelope::MessageEnvelope;
use crate::storage::StorageResult;

pub mod memory;
pub mod redis;
pub mod sql;

pub use memory::InMemoryDeadLetterStore;
pub use redis::RedisDeadLetterStore;
pub use sql::SqlDeadLetterStore;

/// A permanently failed message with its failure metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Id of the failed message
    pub message_id: String,
    /// JSON-serialized envelope as it was at failure time
    pub envelope: Vec<u8>,
    /// Terminal failure reason
    pub reason: String,
    /// When the message was dead-lettered
    pub failed_at: DateTime<Utc>,
    /// Attempt counter at dead-lettering time
    pub final_attempt: u32,
}

impl DeadLetterEntry {
    /// Build an entry from a failed envelope
    pub fn from_envelope(
        envelope: &MessageEnvelope,
        reason: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> StorageResult<Self> {
        Ok(Self {
            message_id: envelope.id.clone(),
            envelope: serde_json::to_vec(envelope)?,
            reason: reason.into(),
            failed_at,
            final_attempt: envelope.attempt,
        })
    }

    /// Deserialize the stored envelope
    pub fn decode_envelope(&self) -> StorageResult<MessageEnvelope> {
        Ok(serde_json::from_slice(&self.envelope)?)
    }

    /// The stored envelope prepared for re-enqueue: ready, unleased,
    /// immediately visible, attempt counter preserved
    pub fn replay_envelope(&self, now: DateTime<Utc>) -> StorageResult<MessageEnvelope> {
        let mut envelope = self.decode_envelope()?;
        envelope.state = crate::core::envelope::MessageState::Ready;
        envelope.lease = None;
        envelope.next_visible_at = now;
        Ok(envelope)
    }
}

/// Append-only log of dead-lettered messages
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Append an entry
    async fn append(&self, entry: DeadLetterEntry) -> StorageResult<()>;

    /// Page through entries in failure order
    async fn page(&self, offset: u64, limit: u64) -> StorageResult<Vec<DeadLetterEntry>>;

    /// Remove and return the entry for `message_id`, if present
    async fn take(&self, message_id: &str) -> StorageResult<Option<DeadLetterEntry>>;

    /// Number of stored entries
    async fn len(&self) -> StorageResult<u64>;
}
