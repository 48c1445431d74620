use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use super::SharedStore;
use crate::{Error, Result};

const CHANNEL_CAPACITY: usize = 1024;

enum Value {
    Str(String),
    Set(HashSet<String>),
    List(VecDeque<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process store for single-worker mode and tests.
///
/// Expiry follows the tokio clock, so tests running with a paused clock can
/// move TTLs forward with `tokio::time::advance`. The store can be switched
/// unavailable to exercise the error paths of its callers.
pub struct MemoryStore {
    data: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
    publish_available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            publish_available: AtomicBool::new(true),
        }
    }

    /// Make every operation fail with [`Error::TransientStore`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make only `publish` fail, leaving keys and sets reachable.
    pub fn set_publish_available(&self, available: bool) {
        self.publish_available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::TransientStore("memory store unavailable".to_string()))
        }
    }

    /// Run `f` against the live entry for `key`, dropping it first if expired.
    fn with_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&mut Entry>) -> Result<T>,
    ) -> Result<T> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }
        f(data.get_mut(key))
    }

    fn write(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.data
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Store(format!("WRONGTYPE operation against key {key}"))
}

fn as_str<'a>(key: &str, entry: &'a Entry) -> Result<&'a str> {
    match &entry.value {
        Value::Str(s) => Ok(s),
        _ => Err(wrong_type(key)),
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_entry(key, |entry| match entry {
            Some(entry) => as_str(key, entry).map(|s| Some(s.to_string())),
            None => Ok(None),
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.check()?;
        self.write(key, Value::Str(value.to_string()), Some(ttl));
        Ok(())
    }

    async fn swap_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<Option<String>> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        let previous = match data.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(as_str(key, entry)?.to_string()),
            _ => None,
        };
        data.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(previous)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        let matches = match data.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                matches!(&entry.value, Value::Str(s) if s == expected)
            }
            _ => false,
        };
        if matches {
            data.remove(key);
        }
        Ok(matches)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .data
            .lock()
            .remove(key)
            .is_some_and(|entry| !entry.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        self.with_entry(key, |entry| {
            Ok(entry
                .map(|entry| entry.expires_at = Some(Instant::now() + ttl))
                .is_some())
        })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_entry(key, |entry| Ok(entry.is_some()))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let inserted = self.with_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                set.insert(member.to_string());
                Ok(true)
            }
            Some(_) => Err(wrong_type(key)),
            None => Ok(false),
        })?;
        if !inserted {
            let set = HashSet::from([member.to_string()]);
            self.write(key, Value::Set(set), None);
        }
        Ok(())
    }

    async fn srem_unless_exists(&self, key: &str, member: &str, guard: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(guard).is_some_and(|e| !e.is_expired(now)) {
            return Ok(false);
        }

        let (removed, emptied) = match data.get_mut(key) {
            Some(entry) if entry.is_expired(now) => (false, true),
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => {
                let removed = set.remove(member);
                (removed, set.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
            None => (false, false),
        };
        if emptied {
            data.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        self.with_entry(key, |entry| match entry {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(Vec::new()),
        })
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<usize> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        if data.get(key).is_some_and(|e| e.is_expired(now)) {
            data.remove(key);
        }

        let entry = data.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        let Value::List(list) = &mut entry.value else {
            return Err(wrong_type(key));
        };

        list.push_back(value.to_string());
        let len = list.len();
        while list.len() > cap {
            list.pop_front();
        }
        entry.expires_at = Some(now + ttl);
        Ok(len)
    }

    async fn take_list(&self, key: &str) -> Result<Vec<String>> {
        self.check()?;
        let now = Instant::now();
        let mut data = self.data.lock();
        match data.remove(key) {
            Some(entry) if entry.is_expired(now) => Ok(Vec::new()),
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.into_iter().collect()),
            Some(entry) => {
                data.insert(key.to_string(), entry);
                Err(wrong_type(key))
            }
            None => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.check()?;
        if !self.publish_available.load(Ordering::SeqCst) {
            return Err(Error::TransientStore("publish unavailable".to_string()));
        }
        let channels = self.channels.lock();
        Ok(channels
            .get(channel)
            .and_then(|tx| tx.send(payload.to_string()).ok())
            .unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        self.check()?;
        let rx = self
            .channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = BroadcastStream::new(rx)
            .filter_map(|item| futures::future::ready(item.ok()));
        Ok(stream.boxed())
    }
}
