//! Message envelope
//!
//! The persisted unit of work: identity, payload, FIFO placement,
//! deduplication key, and delivery bookkeeping. Envelopes are created by
//! transports, persisted by a storage provider, and handed to handlers
//! by a processing strategy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal and non-terminal message states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i16)]
pub enum MessageState {
    /// Queued; visible once `next_visible_at` passes and no lease is held
    Ready = 0,
    /// Acknowledged by a handler (or collapsed by deduplication)
    Succeeded = 1,
    /// Exhausted retries or failed non-retryably; lives in the dead-letter store
    DeadLettered = 2,
}

impl MessageState {
    /// Whether this state is terminal
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MessageState::Ready)
    }

    /// Decode from the persisted smallint representation
    pub fn from_i16(value: i16) -> Option<Self> {
        match value {
            0 => Some(MessageState::Ready),
            1 => Some(MessageState::Succeeded),
            2 => Some(MessageState::DeadLettered),
            _ => None,
        }
    }
}

/// Outcome of persisting an envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnqueueOutcome {
    /// Persisted and eligible for dispatch
    Accepted,
    /// An envelope with this id already exists in the inbox
    DuplicateId,
    /// A live dedup entry collapsed this envelope; it was persisted
    /// already in `Succeeded` state and will never dispatch
    DedupHit,
}

/// The persisted unit: id, payload, metadata, state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique identifier within the inbox
    pub id: String,
    /// Sender-supplied duplicate-collapse key
    pub dedup_key: Option<String>,
    /// FIFO group membership
    pub group_id: Option<String>,
    /// Ordering within the FIFO group
    pub group_seq: Option<i64>,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Content-type tag; never interpreted by the runtime
    pub content_type: String,
    /// Set by the storage provider on enqueue
    pub enqueued_at: DateTime<Utc>,
    /// Failed dispatch count; monotone, never reset
    pub attempt: u32,
    /// Visibility horizon
    pub next_visible_at: DateTime<Utc>,
    /// Current lease token, if leased
    pub lease: Option<String>,
    /// Delivery state
    pub state: MessageState,
}

impl MessageEnvelope {
    /// Create an envelope with a fresh UUID id and the given payload
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), payload)
    }

    /// Create an envelope with an explicit id
    pub fn with_id(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            dedup_key: None,
            group_id: None,
            group_seq: None,
            payload: payload.into(),
            content_type: "application/octet-stream".to_string(),
            enqueued_at: now,
            attempt: 0,
            next_visible_at: now,
            lease: None,
            state: MessageState::Ready,
        }
    }

    /// Set the deduplication key
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Place the envelope in a FIFO group at the given sequence number
    pub fn with_group(mut self, group_id: impl Into<String>, seq: i64) -> Self {
        self.group_id = Some(group_id.into());
        self.group_seq = Some(seq);
        self
    }

    /// Set the content-type tag
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Whether the envelope is visible at `now`: ready, unleased (or
    /// lease lapsed), and past its visibility horizon
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.state == MessageState::Ready && self.next_visible_at <= now
    }

    /// Whether a live lease is held at `now`
    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease.is_some() && self.next_visible_at > now && self.state == MessageState::Ready
    }

    /// Whether the given token matches a live lease at `now`
    pub fn lease_matches(&self, token: &str, now: DateTime<Utc>) -> bool {
        self.is_leased(now) && self.lease.as_deref() == Some(token)
    }

    /// UTF-8 view of the payload, if valid
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_assigns_id_and_defaults() {
        let env = MessageEnvelope::new(b"hello".to_vec());
        assert!(!env.id.is_empty());
        assert_eq!(env.attempt, 0);
        assert_eq!(env.state, MessageState::Ready);
        assert!(env.lease.is_none());
        assert_eq!(env.payload_str(), Some("hello"));
    }

    #[test]
    fn test_builders() {
        let env = MessageEnvelope::with_id("msg-1", b"{}".to_vec())
            .with_dedup_key("k")
            .with_group("g", 7)
            .with_content_type("application/json");

        assert_eq!(env.id, "msg-1");
        assert_eq!(env.dedup_key.as_deref(), Some("k"));
        assert_eq!(env.group_id.as_deref(), Some("g"));
        assert_eq!(env.group_seq, Some(7));
        assert_eq!(env.content_type, "application/json");
    }

    #[test]
    fn test_visibility() {
        let now = Utc::now();
        let mut env = MessageEnvelope::with_id("msg-1", vec![]);
        env.next_visible_at = now;
        assert!(env.is_visible(now));

        env.next_visible_at = now + Duration::seconds(10);
        assert!(!env.is_visible(now));
        assert!(env.is_visible(now + Duration::seconds(10)));

        env.state = MessageState::Succeeded;
        assert!(!env.is_visible(now + Duration::seconds(10)));
    }

    #[test]
    fn test_lease_expiry_makes_visible() {
        let now = Utc::now();
        let mut env = MessageEnvelope::with_id("msg-1", vec![]);
        env.lease = Some("token".to_string());
        env.next_visible_at = now + Duration::seconds(30);

        assert!(env.is_leased(now));
        assert!(env.lease_matches("token", now));
        assert!(!env.lease_matches("other", now));

        // Lease lapses when the horizon passes
        let later = now + Duration::seconds(31);
        assert!(!env.is_leased(later));
        assert!(env.is_visible(later));
    }

    #[test]
    fn test_state_roundtrip() {
        for state in [
            MessageState::Ready,
            MessageState::Succeeded,
            MessageState::DeadLettered,
        ] {
            assert_eq!(MessageState::from_i16(state as i16), Some(state));
        }
        assert_eq!(MessageState::from_i16(9), None);
    }
}
