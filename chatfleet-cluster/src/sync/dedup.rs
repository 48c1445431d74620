//! Recipient-side duplicate suppression.
//!
//! A message can reach a recipient twice when the fan-out publish timed out
//! after Redis had already delivered it and the router fell back to the
//! pending queue. Each worker remembers which `(recipient, message_id)` pairs
//! it delivered for a while and drops repeats.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct DedupKey {
    recipient: String,
    message_id: String,
}

impl DedupKey {
    fn new(recipient: &str, message_id: &str) -> Self {
        Self {
            recipient: recipient.to_string(),
            message_id: message_id.to_string(),
        }
    }
}

/// Message deduplicator with automatic cleanup
#[derive(Clone)]
pub struct MessageDeduplicator {
    entries: Arc<DashMap<DedupKey, Instant>>,
    window: Duration,
}

impl MessageDeduplicator {
    /// Create a deduplicator and start its cleanup task.
    ///
    /// The cleanup task stops once every clone has been dropped.
    #[must_use]
    pub fn new(window: Duration, cleanup_interval: Duration) -> Self {
        let dedup = Self {
            entries: Arc::new(DashMap::new()),
            window,
        };

        let entries = Arc::downgrade(&dedup.entries);
        tokio::spawn(run_cleanup(entries, cleanup_interval));

        dedup
    }

    /// Whether the message was already delivered to this recipient within
    /// the window.
    #[must_use]
    pub fn is_duplicate(&self, recipient: &str, message_id: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(&DedupKey::new(recipient, message_id))
            .is_some_and(|expires_at| *expires_at > now)
    }

    pub fn mark_delivered(&self, recipient: &str, message_id: &str) {
        self.entries
            .insert(DedupKey::new(recipient, message_id), Instant::now() + self.window);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn cleanup_expired(entries: &DashMap<DedupKey, Instant>) {
    let now = Instant::now();
    entries.retain(|_, expires_at| *expires_at > now);
}

async fn run_cleanup(entries: Weak<DashMap<DedupKey, Instant>>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(entries) = entries.upgrade() else {
            break;
        };
        cleanup_expired(&entries);
    }
}
