use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::models::{PresenceEntry, PresenceEvent, PresenceEventKind};
use crate::store::{self, SharedStore, ONLINE_USERS_KEY, PRESENCE_CHANNEL};
use crate::Result;

/// Outcome of a successful [`PresenceRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    /// The entry now stored for the username
    pub entry: PresenceEntry,
    /// The entry this registration replaced, if the user was already online
    pub evicted: Option<PresenceEntry>,
}

/// Tracks which usernames are connected and which worker owns each one.
///
/// A username has at most one entry. Registering an already-online username
/// replaces the old entry atomically and reports it as evicted; the owner of
/// the evicted entry learns about it from the presence channel.
///
/// The `online_users` set is an index over the `online_user:{username}`
/// keys. A member is only ever removed while its key is absent, and every
/// heartbeat adds it back, so a live entry cannot stay unlisted.
#[derive(Clone)]
pub struct PresenceRegistry {
    store: Arc<dyn SharedStore>,
    ttl: Duration,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn SharedStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn register(
        &self,
        username: &str,
        worker_id: &str,
        user_id: Option<i64>,
    ) -> Result<Registration> {
        self.register_entry(PresenceEntry::new(username, worker_id, user_id))
            .await
    }

    /// Store an entry built by the caller, replacing any entry for the same
    /// username.
    pub async fn register_entry(&self, entry: PresenceEntry) -> Result<Registration> {
        let username = entry.username.as_str();
        let worker_id = entry.worker_id.as_str();
        let json = serde_json::to_string(&entry)?;

        let previous = self
            .store
            .swap_ex(&store::online_user_key(username), &json, self.ttl)
            .await?;
        self.store.sadd(ONLINE_USERS_KEY, username).await?;

        let evicted = previous.and_then(|raw| decode_entry(username, &raw));

        if let Some(ref old) = evicted {
            warn!(
                target: "audit",
                username = %username,
                evicted_worker_id = %old.worker_id,
                worker_id = %worker_id,
                "Presence replaced by newer login"
            );
            self.notify(PresenceEventKind::Evicted, username, &old.worker_id)
                .await;
        }

        self.notify(PresenceEventKind::Joined, username, worker_id).await;
        info!(username = %username, worker_id = %worker_id, "User registered online");

        Ok(Registration { entry, evicted })
    }

    /// Extend the TTL of an existing entry and make sure it is listed.
    /// Returns false if the user is not registered.
    pub async fn heartbeat(&self, username: &str) -> Result<bool> {
        let refreshed = self
            .store
            .expire(&store::online_user_key(username), self.ttl)
            .await?;
        if refreshed {
            self.store.sadd(ONLINE_USERS_KEY, username).await?;
        } else {
            debug!(username = %username, "Heartbeat for user with no presence entry");
        }
        Ok(refreshed)
    }

    /// Remove a username regardless of which worker owns it.
    pub async fn unregister(&self, username: &str) -> Result<()> {
        let existed = self.store.del(&store::online_user_key(username)).await?;
        self.unlist(username).await?;

        if existed {
            self.notify(PresenceEventKind::Left, username, "").await;
            info!(username = %username, "User unregistered");
        }
        Ok(())
    }

    /// Remove the entry only if it is still the one described by `entry`.
    ///
    /// A connection tearing down after a newer login took over must not
    /// remove the newer registration.
    pub async fn unregister_if_owned(&self, entry: &PresenceEntry) -> Result<bool> {
        let json = serde_json::to_string(entry)?;
        let removed = self
            .store
            .compare_and_delete(&store::online_user_key(&entry.username), &json)
            .await?;

        if removed {
            self.unlist(&entry.username).await?;
            self.notify(PresenceEventKind::Left, &entry.username, &entry.worker_id)
                .await;
            info!(
                username = %entry.username,
                worker_id = %entry.worker_id,
                "User unregistered"
            );
        } else {
            debug!(
                username = %entry.username,
                worker_id = %entry.worker_id,
                "Presence entry already replaced, leaving it in place"
            );
        }
        Ok(removed)
    }

    pub async fn lookup(&self, username: &str) -> Result<Option<PresenceEntry>> {
        let raw = self.store.get(&store::online_user_key(username)).await?;
        Ok(raw.and_then(|raw| decode_entry(username, &raw)))
    }

    /// Usernames with a live entry, sorted.
    ///
    /// Set members whose entry has expired are removed on the way.
    pub async fn list_online(&self) -> Result<Vec<String>> {
        let members = self.store.smembers(ONLINE_USERS_KEY).await?;
        let mut online = Vec::with_capacity(members.len());

        for username in members {
            if self.store.exists(&store::online_user_key(&username)).await? {
                online.push(username);
            } else if self.unlist(&username).await? {
                debug!(username = %username, "Removed stale online member");
            }
        }

        online.sort();
        Ok(online)
    }

    /// Number of usernames with a live entry. Members left behind by
    /// crashed workers are not counted.
    pub async fn count(&self) -> Result<usize> {
        Ok(self.list_online().await?.len())
    }

    /// Drop a username from `online_users` unless it has an entry again.
    async fn unlist(&self, username: &str) -> Result<bool> {
        self.store
            .srem_unless_exists(ONLINE_USERS_KEY, username, &store::online_user_key(username))
            .await
    }

    async fn notify(&self, kind: PresenceEventKind, username: &str, worker_id: &str) {
        let event = PresenceEvent::new(kind, username, worker_id);
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to serialize presence event");
                return;
            }
        };
        if let Err(e) = self.store.publish(PRESENCE_CHANNEL, &payload).await {
            warn!(error = %e, username = %username, "Failed to publish presence event");
        }
    }
}

fn decode_entry(username: &str, raw: &str) -> Option<PresenceEntry> {
    match serde_json::from_str::<PresenceEntry>(raw) {
        Ok(mut entry) => {
            entry.username = username.to_string();
            Some(entry)
        }
        Err(e) => {
            warn!(error = %e, username = %username, "Discarding malformed presence entry");
            None
        }
    }
}
