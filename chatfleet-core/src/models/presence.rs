use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value stored under `online_user:{username}`.
///
/// The username is the key, so it is not repeated in the stored JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEntry {
    #[serde(skip)]
    pub username: String,
    pub worker_id: String,
    pub login_time: DateTime<Utc>,
    pub user_id: Option<i64>,
}

impl PresenceEntry {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        worker_id: impl Into<String>,
        user_id: Option<i64>,
    ) -> Self {
        Self {
            username: username.into(),
            worker_id: worker_id.into(),
            login_time: Utc::now(),
            user_id,
        }
    }

    #[must_use]
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.worker_id == worker_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceEventKind {
    Joined,
    Left,
    /// A newer login replaced this worker's registration
    Evicted,
}

/// Presence-changed notification published on the presence channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub kind: PresenceEventKind,
    pub username: String,
    pub worker_id: String,
    pub at: DateTime<Utc>,
}

impl PresenceEvent {
    #[must_use]
    pub fn new(kind: PresenceEventKind, username: &str, worker_id: &str) -> Self {
        Self {
            kind,
            username: username.to_string(),
            worker_id: worker_id.to_string(),
            at: Utc::now(),
        }
    }
}
