use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A direct message between two users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Random id used by recipients to drop duplicate deliveries
    pub message_id: String,
    pub from: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(from: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            message_id: nanoid::nanoid!(16),
            from: from.into(),
            body: body.into(),
            sent_at: Utc::now(),
        }
    }
}

/// Entry of the `pending_messages:{username}` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub payload: ChatMessage,
    /// When the message was queued
    pub timestamp: DateTime<Utc>,
}

impl PendingMessage {
    #[must_use]
    pub fn new(payload: ChatMessage) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn is_expired(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.timestamp) > ttl
    }
}

/// Cross-worker delivery request published on the fan-out channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingEvent {
    pub target_username: String,
    pub payload: ChatMessage,
    pub origin_worker_id: String,
    /// Worker that owned the recipient's presence when the event was sent
    #[serde(default)]
    pub target_worker_id: String,
}
