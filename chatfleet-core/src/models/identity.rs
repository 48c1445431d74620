use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An authenticated user, as vouched for by the credential verifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: i64,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn new(user_id: i64, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// Value stored under `session:{token}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub username: String,
    pub user_id: i64,
    pub issued_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl SessionRecord {
    #[must_use]
    pub fn new(identity: &Identity) -> Self {
        let now = Utc::now();
        Self {
            username: identity.username.clone(),
            user_id: identity.user_id,
            issued_at: now,
            last_active: now,
        }
    }

    #[must_use]
    pub fn identity(&self) -> Identity {
        Identity::new(self.user_id, self.username.clone())
    }
}
