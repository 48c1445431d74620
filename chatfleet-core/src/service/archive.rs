//! Message archive boundary.
//!
//! Every direct message is recorded before it is routed. The archive lives
//! in the persistent store, next to the accounts behind
//! [`super::CredentialVerifier`]; workers only see this trait.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::models::ChatMessage;
use crate::Result;

/// Conversation length returned when a client does not ask for a limit.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

#[async_trait]
pub trait MessageArchive: Send + Sync + 'static {
    /// Record a message sent to `to`.
    async fn record(&self, to: &str, message: &ChatMessage) -> Result<()>;

    /// The newest `limit` messages exchanged between two users, oldest first.
    async fn conversation(&self, user: &str, other: &str, limit: usize)
        -> Result<Vec<ChatMessage>>;
}

/// Process-local archive for development and tests.
///
/// Conversations are lost on restart and are not shared between workers.
#[derive(Default)]
pub struct InMemoryArchive {
    conversations: RwLock<HashMap<(String, String), Vec<ChatMessage>>>,
}

impl InMemoryArchive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Both directions of a conversation share one key.
fn conversation_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

#[async_trait]
impl MessageArchive for InMemoryArchive {
    async fn record(&self, to: &str, message: &ChatMessage) -> Result<()> {
        self.conversations
            .write()
            .entry(conversation_key(&message.from, to))
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn conversation(
        &self,
        user: &str,
        other: &str,
        limit: usize,
    ) -> Result<Vec<ChatMessage>> {
        let conversations = self.conversations.read();
        let Some(messages) = conversations.get(&conversation_key(user, other)) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(limit);
        Ok(messages[start..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_conversation_is_shared_by_both_sides() {
        let archive = InMemoryArchive::new();
        archive
            .record("bob", &ChatMessage::new("alice", "hi bob"))
            .await
            .unwrap();
        archive
            .record("alice", &ChatMessage::new("bob", "hi alice"))
            .await
            .unwrap();
        archive
            .record("carol", &ChatMessage::new("alice", "unrelated"))
            .await
            .unwrap();

        let from_alice: Vec<_> = archive
            .conversation("alice", "bob", DEFAULT_HISTORY_LIMIT)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(from_alice, vec!["hi bob", "hi alice"]);
        assert_eq!(
            archive.conversation("bob", "alice", 10).await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn test_limit_keeps_newest() {
        let archive = InMemoryArchive::new();
        for i in 0..5 {
            archive
                .record("bob", &ChatMessage::new("alice", format!("m{i}")))
                .await
                .unwrap();
        }

        let bodies: Vec<_> = archive
            .conversation("bob", "alice", 2)
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(bodies, vec!["m3", "m4"]);
        assert!(archive.conversation("bob", "dave", 2).await.unwrap().is_empty());
    }
}
