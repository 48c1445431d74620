//! Shared fast store used to coordinate the fleet.
//!
//! Only atomic per-key primitives are exposed. Nothing here spans more than
//! one key in a transaction, so every caller must tolerate interleavings
//! between its own calls.

pub mod memory;
pub mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::Result;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Fan-out channel carrying [`crate::models::RoutingEvent`]s.
pub const CHAT_CHANNEL: &str = "chat_messages";
/// Channel carrying [`crate::models::PresenceEvent`]s.
pub const PRESENCE_CHANNEL: &str = "presence_events";
/// Set of online usernames.
pub const ONLINE_USERS_KEY: &str = "online_users";

#[must_use]
pub fn session_key(token: &str) -> String {
    format!("session:{token}")
}

#[must_use]
pub fn user_session_key(username: &str) -> String {
    format!("user_session:{username}")
}

#[must_use]
pub fn online_user_key(username: &str) -> String {
    format!("online_user:{username}")
}

#[must_use]
pub fn pending_key(username: &str) -> String {
    format!("pending_messages:{username}")
}

/// Atomic per-key operations against the shared store.
///
/// Connectivity failures and timeouts come back as
/// [`crate::Error::TransientStore`]; callers decide whether to retry.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Write `value` with a TTL and return whatever was stored before.
    async fn swap_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<Option<String>>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    /// Reset the TTL of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;

    /// Remove `member` from the set at `key` unless `guard` exists, in one
    /// step. Returns true if the member was removed.
    async fn srem_unless_exists(&self, key: &str, member: &str, guard: &str) -> Result<bool>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    /// Append to a list, keep only the newest `cap` entries and reset the TTL.
    ///
    /// Returns the list length after the append and before trimming, so
    /// `len.saturating_sub(cap)` is the number of entries dropped.
    async fn push_bounded(&self, key: &str, value: &str, cap: usize, ttl: Duration)
        -> Result<usize>;

    /// Read the whole list and delete it in one step.
    async fn take_list(&self, key: &str) -> Result<Vec<String>>;

    /// Returns the number of subscribers that received the payload.
    async fn publish(&self, channel: &str, payload: &str) -> Result<usize>;

    /// Subscribe to a channel. The stream ends when the underlying
    /// connection is lost; callers re-subscribe.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}
