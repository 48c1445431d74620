use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::aio::ConnectionManager;
use tokio::time::timeout;

use super::SharedStore;
use crate::{Error, Result};

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Removes ARGV[1] from the set KEYS[1] only while KEYS[2] does not exist.
const SREM_UNLESS_EXISTS_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[2]) == 0 then
    return redis.call('SREM', KEYS[1], ARGV[1])
else
    return 0
end
";

/// Redis-backed store.
///
/// Regular commands share one auto-reconnecting [`ConnectionManager`];
/// every subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisStore {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::Configuration(format!("Invalid Redis URL: {e}")))?;

        let conn = match timeout(op_timeout, ConnectionManager::new(client.clone())).await {
            Ok(conn) => conn?,
            Err(_) => {
                return Err(Error::TransientStore(format!(
                    "Timed out connecting to Redis at {url}"
                )))
            }
        };

        tracing::info!(timeout_ms = op_timeout.as_millis() as u64, "Connected to Redis");

        Ok(Self {
            client,
            conn,
            op_timeout,
        })
    }

    async fn timed<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match timeout(self.op_timeout, fut).await {
            Ok(res) => res.map_err(Error::from),
            Err(_) => Err(Error::TransientStore(format!("Redis {op} timed out"))),
        }
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.timed(
            "GET",
            redis::cmd("GET").arg(key).query_async::<Option<String>>(&mut conn),
        )
        .await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        self.timed(
            "SET",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async::<()>(&mut conn),
        )
        .await
    }

    async fn swap_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        // SET .. GET needs Redis 6.2 or newer
        self.timed(
            "SET GET",
            redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("EX")
                .arg(ttl_secs(ttl))
                .arg("GET")
                .query_async::<Option<String>>(&mut conn),
        )
        .await
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(COMPARE_AND_DELETE_SCRIPT);
        let removed: i64 = self
            .timed(
                "compare-and-delete",
                script.key(key).arg(expected).invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = self
            .timed("DEL", redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(removed > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.timed(
            "EXPIRE",
            redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .query_async::<bool>(&mut conn),
        )
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        self.timed(
            "EXISTS",
            redis::cmd("EXISTS").arg(key).query_async::<bool>(&mut conn),
        )
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.timed(
            "SADD",
            redis::cmd("SADD").arg(key).arg(member).query_async::<()>(&mut conn),
        )
        .await
    }

    async fn srem_unless_exists(&self, key: &str, member: &str, guard: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let script = redis::Script::new(SREM_UNLESS_EXISTS_SCRIPT);
        let removed: i64 = self
            .timed(
                "conditional SREM",
                script.key(key).key(guard).arg(member).invoke_async(&mut conn),
            )
            .await?;
        Ok(removed == 1)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.timed(
            "SMEMBERS",
            redis::cmd("SMEMBERS").arg(key).query_async::<Vec<String>>(&mut conn),
        )
        .await
    }

    async fn push_bounded(
        &self,
        key: &str,
        value: &str,
        cap: usize,
        ttl: Duration,
    ) -> Result<usize> {
        let mut conn = self.conn.clone();
        let keep_from = -(i64::try_from(cap).unwrap_or(i64::MAX));

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .cmd("LTRIM")
            .arg(key)
            .arg(keep_from)
            .arg(-1)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore();

        let (len,): (usize,) = self.timed("RPUSH", pipe.query_async(&mut conn)).await?;
        Ok(len)
    }

    async fn take_list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .cmd("DEL")
            .arg(key)
            .ignore();

        let (items,): (Vec<String>,) = self.timed("LRANGE", pipe.query_async(&mut conn)).await?;
        Ok(items)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.timed(
            "PUBLISH",
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async::<usize>(&mut conn),
        )
        .await
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .timed("pub/sub connect", self.client.get_async_pubsub())
            .await?;
        self.timed("SUBSCRIBE", pubsub.subscribe(channel)).await?;

        let channel_name = channel.to_string();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let payload = match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(error = %e, channel = %channel_name, "Invalid pub/sub payload");
                    None
                }
            };
            futures::future::ready(payload)
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_URL: &str = "redis://localhost:6379";

    #[test]
    fn test_ttl_secs_never_zero() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(600)), 600);
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let err = RedisStore::connect("not-a-url", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_swap_and_compare_and_delete() {
        let store = RedisStore::connect(TEST_URL, Duration::from_secs(5))
            .await
            .unwrap();
        let key = format!("chatfleet_test:{}", nanoid::nanoid!(8));

        assert_eq!(store.swap_ex(&key, "a", Duration::from_secs(30)).await.unwrap(), None);
        assert_eq!(
            store.swap_ex(&key, "b", Duration::from_secs(30)).await.unwrap(),
            Some("a".to_string())
        );
        assert!(!store.compare_and_delete(&key, "a").await.unwrap());
        assert!(store.compare_and_delete(&key, "b").await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_push_bounded_trims_oldest() {
        let store = RedisStore::connect(TEST_URL, Duration::from_secs(5))
            .await
            .unwrap();
        let key = format!("chatfleet_test:{}", nanoid::nanoid!(8));

        for i in 0..5 {
            store
                .push_bounded(&key, &i.to_string(), 3, Duration::from_secs(30))
                .await
                .unwrap();
        }

        assert_eq!(store.take_list(&key).await.unwrap(), vec!["2", "3", "4"]);
        assert!(store.take_list(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "Requires Redis server"]
    async fn test_srem_unless_exists_respects_guard() {
        let store = RedisStore::connect(TEST_URL, Duration::from_secs(5))
            .await
            .unwrap();
        let set = format!("chatfleet_test:{}", nanoid::nanoid!(8));
        let guard = format!("{set}:guard");

        store.sadd(&set, "bob").await.unwrap();
        store.set_ex(&guard, "live", Duration::from_secs(30)).await.unwrap();
        assert!(!store.srem_unless_exists(&set, "bob", &guard).await.unwrap());
        assert_eq!(store.smembers(&set).await.unwrap(), vec!["bob".to_string()]);

        store.del(&guard).await.unwrap();
        assert!(store.srem_unless_exists(&set, "bob", &guard).await.unwrap());
        assert!(store.smembers(&set).await.unwrap().is_empty());
    }
}
