use std::sync::Arc;
use std::time::Duration;

use chatfleet_core::models::{ChatMessage, PendingMessage};
use chatfleet_core::store::{self, SharedStore};
use chatfleet_core::Result;
use chrono::Utc;
use tracing::{debug, warn};

/// Per-recipient offline queue stored at `pending_messages:{username}`.
///
/// Bounded to `capacity` entries with the oldest dropped first. Each entry
/// also expires on its own once it is older than `ttl`, even if newer
/// entries keep the list alive.
#[derive(Clone)]
pub struct PendingQueue {
    store: Arc<dyn SharedStore>,
    capacity: usize,
    ttl: Duration,
}

impl PendingQueue {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, capacity: usize, ttl: Duration) -> Self {
        Self {
            store,
            capacity,
            ttl,
        }
    }

    /// Append a message for an offline recipient.
    ///
    /// Returns how many older messages were dropped to stay within capacity.
    pub async fn enqueue(&self, recipient: &str, message: ChatMessage) -> Result<usize> {
        let entry = serde_json::to_string(&PendingMessage::new(message))?;
        let len = self
            .store
            .push_bounded(&store::pending_key(recipient), &entry, self.capacity, self.ttl)
            .await?;

        let dropped = len.saturating_sub(self.capacity);
        if dropped > 0 {
            warn!(
                recipient = %recipient,
                dropped,
                capacity = self.capacity,
                "Pending queue full, dropped oldest message"
            );
        } else {
            debug!(recipient = %recipient, queued = len, "Message queued for offline recipient");
        }
        Ok(dropped)
    }

    /// Atomically read and clear the queue, oldest first.
    pub async fn take(&self, recipient: &str) -> Result<Vec<ChatMessage>> {
        let raw = self.store.take_list(&store::pending_key(recipient)).await?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }

        let max_age = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let mut messages = Vec::with_capacity(raw.len());

        for item in raw {
            match serde_json::from_str::<PendingMessage>(&item) {
                Ok(pending) if pending.is_expired(max_age, now) => {
                    debug!(
                        recipient = %recipient,
                        message_id = %pending.payload.message_id,
                        "Discarding expired pending message"
                    );
                }
                Ok(pending) => messages.push(pending.payload),
                Err(e) => {
                    warn!(
                        error = %e,
                        recipient = %recipient,
                        "Discarding malformed pending message"
                    );
                }
            }
        }

        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use chatfleet_core::store::MemoryStore;

    use super::*;

    fn queue() -> (Arc<MemoryStore>, PendingQueue) {
        let store = Arc::new(MemoryStore::new());
        let queue = PendingQueue::new(store.clone(), 100, Duration::from_secs(600));
        (store, queue)
    }

    #[tokio::test]
    async fn test_delivered_in_enqueue_order() {
        let (_, queue) = queue();
        for body in ["m1", "m2", "m3"] {
            queue.enqueue("bob", ChatMessage::new("alice", body)).await.unwrap();
        }

        let bodies: Vec<_> = queue
            .take("bob")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["m1", "m2", "m3"]);
        assert!(queue.take("bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        let (_, queue) = queue();
        for i in 0..100 {
            let dropped = queue
                .enqueue("bob", ChatMessage::new("alice", format!("m{i}")))
                .await
                .unwrap();
            assert_eq!(dropped, 0);
        }

        let dropped = queue
            .enqueue("bob", ChatMessage::new("alice", "m100"))
            .await
            .unwrap();
        assert_eq!(dropped, 1);

        let messages = queue.take("bob").await.unwrap();
        assert_eq!(messages.len(), 100);
        assert_eq!(messages[0].body, "m1");
        assert_eq!(messages[99].body, "m100");
    }

    #[tokio::test]
    async fn test_expired_entries_are_skipped() {
        let (store, queue) = queue();
        let mut stale = PendingMessage::new(ChatMessage::new("alice", "old"));
        stale.timestamp = Utc::now() - chrono::Duration::minutes(11);
        store
            .push_bounded(
                &store::pending_key("bob"),
                &serde_json::to_string(&stale).unwrap(),
                100,
                Duration::from_secs(600),
            )
            .await
            .unwrap();
        queue.enqueue("bob", ChatMessage::new("alice", "new")).await.unwrap();

        let messages = queue.take("bob").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "new");
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_expires_with_ttl() {
        let (_, queue) = queue();
        queue.enqueue("bob", ChatMessage::new("alice", "hi")).await.unwrap();

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(queue.take("bob").await.unwrap().is_empty());
    }
}
