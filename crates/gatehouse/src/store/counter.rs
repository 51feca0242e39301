//! TTL counter stores for rate limiting.
//!
//! Contract: atomic increment-and-get that sets the expiry only when the key
//! has none, get, and TTL lookup. Once a key's TTL lapses its counter reads
//! as zero.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use gatehouse_common::GuardError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Entries above this count trigger an opportunistic purge of lapsed keys
const MEMORY_PURGE_THRESHOLD: usize = 10_000;

/// Increments and sets a millisecond expiry when the key has none, in one step
const INCR_WITH_EXPIRY_LUA: &str = r"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Key-value counter store with per-key expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter and return its new value. Applies `ttl` in the
    /// same step when the key has no expiry yet; an existing expiry is kept.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, GuardError>;

    /// Current value, zero when absent or lapsed
    async fn get(&self, key: &str) -> Result<i64, GuardError>;

    /// Remaining lifetime, `None` when absent or without expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, GuardError>;

    /// Connectivity probe
    async fn ping(&self) -> Result<(), GuardError>;
}

struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Process-local substitute used when no Redis is configured
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: RwLock<HashMap<String, Counter>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, GuardError> {
        let now = Instant::now();
        let mut counters = self.counters.write().await;

        if counters.len() > MEMORY_PURGE_THRESHOLD {
            counters.retain(|_, c| c.is_live(now));
        }

        let counter = counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        if !counter.is_live(now) {
            counter.value = 0;
            counter.expires_at = None;
        }
        counter.value += 1;
        if counter.expires_at.is_none() {
            counter.expires_at = now.checked_add(ttl);
        }

        Ok(counter.value)
    }

    async fn get(&self, key: &str) -> Result<i64, GuardError> {
        let now = Instant::now();
        let counters = self.counters.read().await;
        Ok(counters
            .get(key)
            .filter(|c| c.is_live(now))
            .map_or(0, |c| c.value))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, GuardError> {
        let now = Instant::now();
        let counters = self.counters.read().await;
        Ok(counters
            .get(key)
            .filter(|c| c.is_live(now))
            .and_then(|c| c.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn ping(&self) -> Result<(), GuardError> {
        Ok(())
    }
}

/// Shared Redis-backed counter store.
///
/// Every command is bounded by `timeout`; connection failures and timeouts
/// both surface as [`GuardError::StoreUnavailable`].
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    timeout: Duration,
    incr_script: Script,
}

impl RedisCounterStore {
    /// Connect with an auto-reconnecting connection manager
    pub async fn connect(redis_url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = tokio::time::timeout(timeout.max(Duration::from_secs(5)), ConnectionManager::new(client))
            .await
            .context("Timed out connecting to Redis")?
            .context("Failed to connect to Redis")?;

        Ok(Self {
            conn,
            timeout,
            incr_script: Script::new(INCR_WITH_EXPIRY_LUA),
        })
    }

    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T, GuardError>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(op, error = %e, "Redis command failed");
                Err(GuardError::StoreUnavailable(format!("{op}: {e}")))
            }
            Err(_) => {
                tracing::warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Redis command timed out");
                Err(GuardError::StoreUnavailable(format!(
                    "{op}: timed out after {}ms",
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> Result<i64, GuardError> {
        let mut conn = self.conn.clone();
        let mut invocation = self.incr_script.key(key);
        invocation.arg(ttl.as_millis() as u64);

        self.run("INCR", async move {
            let count: i64 = invocation.invoke_async(&mut conn).await?;
            Ok(count)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<i64, GuardError> {
        let mut conn = self.conn.clone();
        let value = self
            .run("GET", async move { conn.get::<_, Option<i64>>(key).await })
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, GuardError> {
        let mut conn = self.conn.clone();
        let millis = self
            .run("PTTL", async move { conn.pttl::<_, i64>(key).await })
            .await?;

        // -2: missing key, -1: no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn ping(&self) -> Result<(), GuardError> {
        let mut conn = self.conn.clone();
        self.run("PING", async move {
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
        .await
    }
}
