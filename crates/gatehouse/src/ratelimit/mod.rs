//! Fixed-window quotas per IP and per destination address.
//!
//! The window opens on the first increment of a key and closes when the
//! store expires it; later increments never extend it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatehouse_common::constants::store_keys::{RATELIMIT_ADDRESS_PREFIX, RATELIMIT_IP_PREFIX};
use gatehouse_common::{GuardError, LimitScope};

use crate::config::RateLimitConfig;
use crate::store::CounterStore;

/// Store key holding the counter for `value` in `scope`
pub fn limit_key(scope: LimitScope, value: &str) -> String {
    match scope {
        LimitScope::Ip => format!("{RATELIMIT_IP_PREFIX}{value}"),
        LimitScope::Address => format!("{RATELIMIT_ADDRESS_PREFIX}{value}"),
    }
}

/// Quota checks and counters consulted by the admission pipeline
#[async_trait]
pub trait Limiter: Send + Sync {
    /// `true` when the IP has used its quota. Never increments.
    async fn check_ip_limit(&self, ip: &str) -> Result<bool, GuardError>;

    /// `true` when the address has used its quota. Never increments.
    async fn check_address_limit(&self, address: &str) -> Result<bool, GuardError>;

    async fn increment_ip_counter(&self, ip: &str) -> Result<(), GuardError>;

    async fn increment_address_counter(&self, address: &str) -> Result<(), GuardError>;

    /// Time until `key`'s window closes
    async fn remaining_time(&self, key: &str) -> Result<Option<Duration>, GuardError>;

    async fn current_count(&self, key: &str) -> Result<i64, GuardError>;
}

/// Counter-store backed rate limiter
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    per_ip: u32,
    per_address: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, per_ip: u32, per_address: u32, window: Duration) -> Self {
        Self {
            store,
            per_ip,
            per_address,
            window,
        }
    }

    pub fn from_config(store: Arc<dyn CounterStore>, config: &RateLimitConfig) -> Self {
        Self::new(store, config.per_ip, config.per_address, config.window)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    async fn is_limited(&self, key: &str, max: u32) -> Result<bool, GuardError> {
        let count = self.store.get(key).await?;
        Ok(count >= i64::from(max))
    }

    async fn increment(&self, key: &str) -> Result<(), GuardError> {
        let count = self.store.incr_with_expiry(key, self.window).await?;
        tracing::debug!(key = %key, count, "Rate limit counter incremented");
        Ok(())
    }
}

#[async_trait]
impl Limiter for RateLimiter {
    async fn check_ip_limit(&self, ip: &str) -> Result<bool, GuardError> {
        self.is_limited(&limit_key(LimitScope::Ip, ip), self.per_ip).await
    }

    async fn check_address_limit(&self, address: &str) -> Result<bool, GuardError> {
        self.is_limited(&limit_key(LimitScope::Address, address), self.per_address)
            .await
    }

    async fn increment_ip_counter(&self, ip: &str) -> Result<(), GuardError> {
        self.increment(&limit_key(LimitScope::Ip, ip)).await
    }

    async fn increment_address_counter(&self, address: &str) -> Result<(), GuardError> {
        self.increment(&limit_key(LimitScope::Address, address)).await
    }

    async fn remaining_time(&self, key: &str) -> Result<Option<Duration>, GuardError> {
        self.store.ttl(key).await
    }

    async fn current_count(&self, key: &str) -> Result<i64, GuardError> {
        self.store.get(key).await
    }
}
