//! Expiring challenge storage.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gatehouse_common::{CaptchaChallenge, PowChallenge};
use tokio::sync::RwLock;

/// A payload that carries its own expiry
pub trait Expiring {
    fn expires_at(&self) -> DateTime<Utc>;
}

impl Expiring for PowChallenge {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl Expiring for CaptchaChallenge {
    fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

/// Keyed store of one-time challenges.
///
/// `remove` returns the evicted entry so callers can treat "I removed it" as
/// the single winner of a race between concurrent consumers.
#[async_trait]
pub trait ChallengeStore<T>: Send + Sync
where
    T: Expiring + Clone + Send + Sync + 'static,
{
    async fn insert(&self, id: String, item: T);

    async fn get(&self, id: &str) -> Option<T>;

    async fn remove(&self, id: &str) -> Option<T>;

    /// Evict every entry that expired before `now`, returning how many went
    async fn sweep(&self, now: DateTime<Utc>) -> usize;

    async fn len(&self) -> usize;
}

/// Process-local challenge store
pub struct MemoryStore<T> {
    entries: RwLock<HashMap<String, T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> ChallengeStore<T> for MemoryStore<T>
where
    T: Expiring + Clone + Send + Sync + 'static,
{
    async fn insert(&self, id: String, item: T) {
        self.entries.write().await.insert(id, item);
    }

    async fn get(&self, id: &str) -> Option<T> {
        self.entries.read().await.get(id).cloned()
    }

    async fn remove(&self, id: &str) -> Option<T> {
        self.entries.write().await.remove(id)
    }

    async fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, item| item.expires_at() >= now);
        before - entries.len()
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn challenge(id: &str, expires_at: DateTime<Utc>) -> PowChallenge {
        PowChallenge {
            challenge_id: id.to_string(),
            nonce: "n".to_string(),
            difficulty: 1,
            created_at: Utc::now(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_remove_is_single_winner() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert("a".into(), challenge("a", now + TimeDelta::minutes(1))).await;

        assert!(store.remove("a").await.is_some());
        assert!(store.remove("a").await.is_none());
        assert!(store.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_evicts_only_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store.insert("old".into(), challenge("old", now - TimeDelta::seconds(5))).await;
        store.insert("fresh".into(), challenge("fresh", now + TimeDelta::minutes(5))).await;

        assert_eq!(store.sweep(now).await, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("fresh").await.is_some());
    }
}
