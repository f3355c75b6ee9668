//! In-memory dead-letter store

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{DeadLetterEntry, DeadLetterStore};
use crate::storage::StorageResult;

/// In-process append log, ordered by failure time of insertion
#[derive(Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> StorageResult<()> {
        self.entries.write().push(entry);
        Ok(())
    }

    async fn page(&self, offset: u64, limit: u64) -> StorageResult<Vec<DeadLetterEntry>> {
        let entries = self.entries.read();
        Ok(entries
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn take(&self, message_id: &str) -> StorageResult<Option<DeadLetterEntry>> {
        let mut entries = self.entries.write();
        let position = entries.iter().position(|e| e.message_id == message_id);
        Ok(position.map(|i| entries.remove(i)))
    }

    async fn len(&self) -> StorageResult<u64> {
        Ok(self.entries.read().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::envelope::MessageEnvelope;
    use chrono::Utc;

    fn entry(id: &str, attempt: u32) -> DeadLetterEntry {
        let mut envelope = MessageEnvelope::with_id(id, b"payload".to_vec());
        envelope.attempt = attempt;
        DeadLetterEntry::from_envelope(&envelope, "boom", Utc::now()).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_page() {
        let store = InMemoryDeadLetterStore::new();
        for i in 0..5 {
            store.append(entry(&format!("msg-{i}"), 3)).await.unwrap();
        }

        assert_eq!(store.len().await.unwrap(), 5);

        let page = store.page(1, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].message_id, "msg-1");
        assert_eq!(page[1].message_id, "msg-2");
    }

    #[tokio::test]
    async fn test_take_removes() {
        let store = InMemoryDeadLetterStore::new();
        store.append(entry("msg-1", 2)).await.unwrap();

        let taken = store.take("msg-1").await.unwrap().unwrap();
        assert_eq!(taken.message_id, "msg-1");
        assert_eq!(taken.final_attempt, 2);
        assert_eq!(store.len().await.unwrap(), 0);
        assert!(store.take("msg-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replay_envelope_resets_delivery_state() {
        let now = Utc::now();
        let mut envelope = MessageEnvelope::with_id("msg-1", b"x".to_vec());
        envelope.attempt = 3;
        envelope.lease = Some("stale".to_string());
        envelope.state = crate::core::envelope::MessageState::DeadLettered;

        let entry = DeadLetterEntry::from_envelope(&envelope, "boom", now).unwrap();
        let replayed = entry.replay_envelope(now).unwrap();

        assert_eq!(replayed.state, crate::core::envelope::MessageState::Ready);
        assert!(replayed.lease.is_none());
        assert_eq!(replayed.next_visible_at, now);
        // Attempt counter survives replay
        assert_eq!(replayed.attempt, 3);
    }
}
