//! Key/value cache with per-entry TTL.
//!
//! Shared by the OCR result cache and the knowledge lookup cache. Two
//! backends: [`MemoryCache`] for single-process deployments and tests, and
//! [`RedisCache`] when `[redis]` is configured. Writes are last-writer-wins.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::Config;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Backend name for readiness reporting.
    fn backend(&self) -> &'static str;

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

pub fn from_config(config: &Config) -> Result<Arc<dyn Cache>> {
    match &config.redis {
        Some(redis) => {
            let cache = RedisCache::new(&redis.url(), RedisPolicy::default())?;
            tracing::info!(address = %redis.address, db = redis.db, "using Redis cache");
            Ok(Arc::new(cache))
        }
        None => Ok(Arc::new(MemoryCache::new(DEFAULT_MEMORY_ENTRIES))),
    }
}

const DEFAULT_MEMORY_ENTRIES: usize = 10_000;

struct Entry {
    value: String,
    expires_at: Instant,
    inserted_at: Instant,
}

/// TTL map bounded to `max_entries`; when full, expired entries are purged
/// first and then the oldest insertion is evicted.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    max_entries: usize,
}

impl MemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?;

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            entries.retain(|_, e| e.expires_at > now);
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: now + ttl,
                inserted_at: now,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("memory cache lock poisoned"))?
            .remove(key);
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug, Clone)]
pub struct RedisPolicy {
    pub timeout: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_open_duration: Duration,
}

impl Default for RedisPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            breaker_failure_threshold: 5,
            breaker_open_duration: Duration::from_secs(30),
        }
    }
}

#[derive(Default)]
struct RedisBreakerState {
    failure_count: u32,
    open_until: Option<Instant>,
}

pub struct RedisCache {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
    policy: RedisPolicy,
    breaker: Mutex<RedisBreakerState>,
}

impl RedisCache {
    pub fn new(url: &str, policy: RedisPolicy) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: tokio::sync::Mutex::new(None),
            policy,
            breaker: Mutex::new(RedisBreakerState::default()),
        })
    }

    fn breaker_check(&self) -> Result<()> {
        let state = self
            .breaker
            .lock()
            .map_err(|_| anyhow!("redis breaker lock poisoned"))?;
        if let Some(until) = state.open_until {
            if Instant::now() < until {
                return Err(anyhow!("redis breaker open"));
            }
        }
        Ok(())
    }

    fn record_success(&self) {
        if let Ok(mut state) = self.breaker.lock() {
            state.failure_count = 0;
            state.open_until = None;
        }
    }

    fn record_failure(&self) {
        if let Ok(mut state) = self.breaker.lock() {
            state.failure_count += 1;
            if state.failure_count >= self.policy.breaker_failure_threshold {
                state.open_until = Some(Instant::now() + self.policy.breaker_open_duration);
            }
        }
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        *self.connection.lock().await = None;
    }

    /// Runs `op` under the breaker and the per-op timeout.
    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(redis::aio::MultiplexedConnection) -> Fut,
        Fut: std::future::Future<Output = redis::RedisResult<T>>,
    {
        self.breaker_check()?;
        let attempt = async {
            let conn = self.connection().await?;
            op(conn).await.map_err(anyhow::Error::from)
        };
        let result = match tokio::time::timeout(self.policy.timeout, attempt).await {
            Ok(r) => r,
            Err(_) => Err(anyhow!("redis timeout")),
        };
        match &result {
            Ok(_) => self.record_success(),
            Err(_) => {
                self.record_failure();
                self.reset_connection().await;
            }
        }
        result
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.guarded(|mut conn| async move { conn.get(key).await })
            .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        let secs = ttl.as_secs().max(1);
        self.guarded(|mut conn| async move { conn.set_ex(key, value, secs).await })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.guarded(|mut conn| async move { conn.del::<_, ()>(key).await })
            .await
    }

    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        self.guarded(|mut conn| async move {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(pong)
        })
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_roundtrip_and_expiry() {
        let cache = MemoryCache::new(10);
        cache
            .set_with_ttl("a", "1", Duration::from_secs(60))
            .await
            .unwrap();
        cache
            .set_with_ttl("b", "2", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.get("b").await.unwrap(), None);
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_evicts_oldest_when_full() {
        let cache = MemoryCache::new(2);
        let ttl = Duration::from_secs(60);
        cache.set_with_ttl("first", "1", ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set_with_ttl("second", "2", ttl).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        cache.set_with_ttl("third", "3", ttl).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("first").await.unwrap(), None);
        assert_eq!(cache.get("third").await.unwrap().as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn memory_overwrite_does_not_evict() {
        let cache = MemoryCache::new(1);
        let ttl = Duration::from_secs(60);
        cache.set_with_ttl("k", "old", ttl).await.unwrap();
        cache.set_with_ttl("k", "new", ttl).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
        cache.delete("k").await.unwrap();
        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_redis_fails_fast_and_opens_breaker() {
        let cache = RedisCache::new(
            "redis://127.0.0.1:1/0",
            RedisPolicy {
                timeout: Duration::from_millis(500),
                breaker_failure_threshold: 2,
                breaker_open_duration: Duration::from_secs(60),
            },
        )
        .unwrap();
        assert!(cache.get("k").await.is_err());
        assert!(cache.get("k").await.is_err());
        let err = cache.get("k").await.unwrap_err();
        assert!(err.to_string().contains("breaker open"));
    }
}
