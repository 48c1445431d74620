use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::models::{Identity, SessionRecord};
use crate::store::{self, SharedStore};
use crate::{Error, Result};

const TOKEN_LENGTH: usize = 32;

/// Issues and validates resumable session tokens.
///
/// Each identity has at most one valid token: `user_session:{username}`
/// points at it, and a token whose pointer moved on is rejected even while
/// its own record is still present.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Issue a fresh token, invalidating whatever token the identity held.
    pub async fn issue(&self, identity: &Identity) -> Result<String> {
        let token = nanoid::nanoid!(TOKEN_LENGTH);
        let record = serde_json::to_string(&SessionRecord::new(identity))?;

        self.store
            .set_ex(&store::session_key(&token), &record, self.ttl)
            .await?;
        let previous = self
            .store
            .swap_ex(&store::user_session_key(&identity.username), &token, self.ttl)
            .await?;

        if let Some(previous) = previous.filter(|p| *p != token) {
            self.store.del(&store::session_key(&previous)).await?;
            info!(username = %identity.username, "Previous session superseded");
        }

        debug!(username = %identity.username, "Session issued");
        Ok(token)
    }

    /// Resolve a token to its identity and slide its expiry forward.
    ///
    /// Returns [`Error::InvalidToken`] when the token is unknown, expired or
    /// superseded by a newer login.
    pub async fn validate(&self, token: &str) -> Result<Identity> {
        let session_key = store::session_key(token);
        let Some(raw) = self.store.get(&session_key).await? else {
            return Err(Error::InvalidToken);
        };
        let mut record: SessionRecord = serde_json::from_str(&raw)?;

        let user_session_key = store::user_session_key(&record.username);
        let current = self.store.get(&user_session_key).await?;
        if current.as_deref() != Some(token) {
            debug!(username = %record.username, "Rejecting superseded session token");
            self.store.del(&session_key).await?;
            return Err(Error::InvalidToken);
        }

        record.last_active = Utc::now();
        self.store
            .set_ex(&session_key, &serde_json::to_string(&record)?, self.ttl)
            .await?;
        self.store.expire(&user_session_key, self.ttl).await?;

        Ok(record.identity())
    }

    /// Explicit logout.
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let session_key = store::session_key(token);
        if let Some(raw) = self.store.get(&session_key).await? {
            let record: SessionRecord = serde_json::from_str(&raw)?;
            self.store
                .compare_and_delete(&store::user_session_key(&record.username), token)
                .await?;
            info!(username = %record.username, "Session revoked");
        }
        self.store.del(&session_key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager() -> (Arc<MemoryStore>, SessionManager) {
        let store = Arc::new(MemoryStore::new());
        let manager = SessionManager::new(store.clone(), Duration::from_secs(600));
        (store, manager)
    }

    #[tokio::test]
    async fn test_issue_and_validate() {
        let (_, sessions) = manager();
        let alice = Identity::new(1, "alice");
        let token = sessions.issue(&alice).await.unwrap();

        assert_eq!(token.len(), TOKEN_LENGTH);
        assert_eq!(sessions.validate(&token).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn test_second_issue_invalidates_first() {
        let (_, sessions) = manager();
        let alice = Identity::new(1, "alice");
        let first = sessions.issue(&alice).await.unwrap();
        let second = sessions.issue(&alice).await.unwrap();

        assert!(matches!(
            sessions.validate(&first).await,
            Err(Error::InvalidToken)
        ));
        assert_eq!(sessions.validate(&second).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let (_, sessions) = manager();
        assert!(matches!(
            sessions.validate("nope").await,
            Err(Error::InvalidToken)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let (_, sessions) = manager();
        let alice = Identity::new(1, "alice");
        let bob = Identity::new(2, "bob");
        let alice_token = sessions.issue(&alice).await.unwrap();
        let bob_token = sessions.issue(&bob).await.unwrap();

        tokio::time::advance(Duration::from_secs(9 * 60 + 59)).await;
        assert_eq!(sessions.validate(&alice_token).await.unwrap(), alice);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(matches!(
            sessions.validate(&bob_token).await,
            Err(Error::InvalidToken)
        ));
        // Alice's validate slid her expiry forward
        assert_eq!(sessions.validate(&alice_token).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn test_revoke() {
        let (store, sessions) = manager();
        let alice = Identity::new(1, "alice");
        let token = sessions.issue(&alice).await.unwrap();

        sessions.revoke(&token).await.unwrap();
        assert!(matches!(
            sessions.validate(&token).await,
            Err(Error::InvalidToken)
        ));
        assert!(!store.exists(&store::user_session_key("alice")).await.unwrap());

        // Revoking twice is harmless
        sessions.revoke(&token).await.unwrap();
    }

    #[tokio::test]
    async fn test_revoking_stale_token_keeps_current_session() {
        let (_, sessions) = manager();
        let alice = Identity::new(1, "alice");
        let old = sessions.issue(&alice).await.unwrap();
        let current = sessions.issue(&alice).await.unwrap();

        sessions.revoke(&old).await.unwrap();
        assert_eq!(sessions.validate(&current).await.unwrap(), alice);
    }

    #[tokio::test]
    async fn test_store_outage_is_not_invalid_token() {
        let (store, sessions) = manager();
        let token = sessions.issue(&Identity::new(1, "alice")).await.unwrap();

        store.set_available(false);
        let err = sessions.validate(&token).await.unwrap_err();
        assert!(matches!(err, Error::TransientStore(_)));
    }
}
