//! Cache abstraction shared by every component.
//!
//! Production uses Redis through a [`ConnectionManager`]; tests and single-node
//! development use [`MemoryCache`]. Rate-limit counters go through
//! [`Cache::incr_window`], which must be atomic per key: the Redis backend runs a
//! single server-side script, the memory backend mutates under the shard lock.

use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Outcome of an atomic windowed-counter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    /// Counter value after the call (unchanged when denied).
    pub count: u32,
    /// Seconds until the window resets; 0 when allowed.
    pub retry_after_secs: u64,
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Remove a key; true when something was deleted.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Windowed counter in one atomic step: a missing counter is created at 1
    /// with TTL = `window` and allowed; a counter at or above `limit` is denied
    /// without incrementing; anything else increments and allows.
    async fn incr_window(&self, key: &str, limit: u32, window: Duration) -> Result<WindowDecision>;
}

/// Fetch a key and deserialize its JSON payload.
pub async fn get_json<T: DeserializeOwned>(cache: &dyn Cache, key: &str) -> Result<Option<T>> {
    match cache.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize a value to JSON and store it.
pub async fn set_json<T: Serialize>(
    cache: &dyn Cache,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    cache.set(key, &raw, ttl).await
}

// Counter script: create-at-1, deny-at-limit (no increment), or increment.
// Returns {allowed, count, remaining_ms}.
const WINDOW_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
    redis.call('SET', KEYS[1], 1, 'PX', ARGV[2])
    return {1, 1, tonumber(ARGV[2])}
end
current = tonumber(current)
if current >= tonumber(ARGV[1]) then
    local ttl = redis.call('PTTL', KEYS[1])
    return {0, current, ttl}
end
current = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
return {1, current, ttl}
"#;

/// Redis-backed cache used in production.
pub struct RedisCache {
    conn: ConnectionManager,
    window_script: Script,
}

impl RedisCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Redis cache");

        Ok(Self {
            conn,
            window_script: Script::new(WINDOW_SCRIPT),
        })
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => {
                // SETEX takes whole seconds and rejects zero.
                let secs = (ttl.as_millis() as u64).div_ceil(1000).max(1);
                let _: () = conn.set_ex(key, value, secs).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let found: bool = conn.exists(key).await?;
        Ok(found)
    }

    async fn incr_window(&self, key: &str, limit: u32, window: Duration) -> Result<WindowDecision> {
        let mut conn = self.conn.clone();
        let (allowed, count, remaining_ms): (i64, i64, i64) = self
            .window_script
            .key(key)
            .arg(limit)
            .arg(window.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;

        let decision = WindowDecision {
            allowed: allowed == 1,
            count: count.max(0) as u32,
            retry_after_secs: if allowed == 1 {
                0
            } else {
                (remaining_ms.max(0) as u64).div_ceil(1000)
            },
        };
        debug!(key = %key, count = decision.count, allowed = decision.allowed, "Window counter");
        Ok(decision)
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// In-process cache with the same semantics as the Redis backend.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if !entry.expired(now) {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Drop the read guard before removing an expired entry.
        self.entries.remove_if(key, |_, entry| entry.expired(now));
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn incr_window(&self, key: &str, limit: u32, window: Duration) -> Result<WindowDecision> {
        let now = Instant::now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: "0".to_string(),
                expires_at: Some(now + window),
            });

        if entry.expired(now) {
            entry.value = "0".to_string();
            entry.expires_at = Some(now + window);
        }

        let count: u32 = entry.value.parse().unwrap_or(0);
        if count >= limit {
            let retry_after = entry
                .expires_at
                .map(|at| at.saturating_duration_since(now).as_secs().max(1))
                .unwrap_or(1);
            return Ok(WindowDecision {
                allowed: false,
                count,
                retry_after_secs: retry_after,
            });
        }

        let count = count + 1;
        entry.value = count.to_string();
        Ok(WindowDecision {
            allowed: true,
            count,
            retry_after_secs: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let cache = MemoryCache::new();
        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        assert!(cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(cache.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete() {
        let cache = MemoryCache::new();
        cache.set("k", "v", None).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_window_counter_denies_at_limit() {
        let cache = MemoryCache::new();
        for expected in 1..=3u32 {
            let decision = cache
                .incr_window("rl:test", 3, Duration::from_secs(60))
                .await
                .unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.count, expected);
        }

        let denied = cache
            .incr_window("rl:test", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.count, 3);
        assert!(denied.retry_after_secs >= 1);

        // A denied call must not advance the counter.
        let again = cache
            .incr_window("rl:test", 3, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(again.count, 3);
    }

    #[tokio::test]
    async fn test_window_counter_resets_after_window() {
        let cache = MemoryCache::new();
        let window = Duration::from_millis(30);
        for _ in 0..2 {
            cache.incr_window("rl:reset", 2, window).await.unwrap();
        }
        assert!(!cache.incr_window("rl:reset", 2, window).await.unwrap().allowed);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let decision = cache.incr_window("rl:reset", 2, window).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.count, 1);
    }

    #[tokio::test]
    async fn test_window_counter_under_concurrency() {
        let cache = Arc::new(MemoryCache::new());
        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .incr_window("rl:conc", 5, Duration::from_secs(60))
                    .await
                    .unwrap()
                    .allowed
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 5);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            id: u32,
            name: String,
        }

        let cache = MemoryCache::new();
        let payload = Payload {
            id: 7,
            name: "seven".to_string(),
        };
        set_json(&cache, "p", &payload, None).await.unwrap();
        let loaded: Option<Payload> = get_json(&cache, "p").await.unwrap();
        assert_eq!(loaded, Some(payload));

        let missing: Option<Payload> = get_json(&cache, "absent").await.unwrap();
        assert!(missing.is_none());
    }
}
