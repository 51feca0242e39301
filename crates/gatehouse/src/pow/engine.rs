//! Proof-of-work challenge issuance and verification.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::Utc;
use gatehouse_common::constants::{
    DEFAULT_POW_DIFFICULTY, POW_CHALLENGE_TTL_SECS, POW_SWEEP_INTERVAL_SECS,
    store_keys::POW_CHALLENGE_PREFIX,
};
use gatehouse_common::{GuardError, PowChallenge};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::clock::deadline;
use crate::store::{ChallengeStore, MemoryStore};
use crate::tasks::spawn_periodic;

const NONCE_LEN: usize = 32;

/// Proof-of-work challenge service
pub struct ProofOfWork {
    store: Arc<dyn ChallengeStore<PowChallenge>>,
    /// Difficulty stamped onto newly issued challenges
    difficulty: AtomicU32,
    challenge_ttl: Duration,
    sweep_interval: Duration,
}

/// Snapshot for stats endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PowStats {
    pub active_challenges: usize,
    pub difficulty: u32,
}

impl ProofOfWork {
    /// Create an engine backed by an in-memory store. A difficulty of zero
    /// falls back to the default.
    pub fn new(difficulty: u32) -> Self {
        Self::with_store(difficulty, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(difficulty: u32, store: Arc<dyn ChallengeStore<PowChallenge>>) -> Self {
        let difficulty = if difficulty == 0 {
            DEFAULT_POW_DIFFICULTY
        } else {
            difficulty
        };

        Self {
            store,
            difficulty: AtomicU32::new(difficulty),
            challenge_ttl: Duration::from_secs(POW_CHALLENGE_TTL_SECS),
            sweep_interval: Duration::from_secs(POW_SWEEP_INTERVAL_SECS),
        }
    }

    pub fn with_challenge_ttl(mut self, ttl: Duration) -> Self {
        self.challenge_ttl = ttl;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Issue a new challenge at the current difficulty
    pub async fn issue_challenge(&self) -> PowChallenge {
        let (challenge_id, nonce) = generate_id_and_nonce();
        let now = Utc::now();

        let challenge = PowChallenge {
            challenge_id: challenge_id.clone(),
            nonce,
            difficulty: self.difficulty(),
            created_at: now,
            expires_at: deadline(now, self.challenge_ttl),
        };

        self.store.insert(challenge_id, challenge.clone()).await;

        tracing::debug!(
            challenge_id = %challenge.challenge_id,
            difficulty = challenge.difficulty,
            "Issued PoW challenge"
        );

        challenge
    }

    /// Verify `solution` against a stored challenge.
    ///
    /// A wrong solution returns `Ok(false)` and leaves the challenge in place
    /// so the client may retry until expiry. A correct one consumes it.
    pub async fn verify(&self, challenge_id: &str, solution: &str) -> Result<bool, GuardError> {
        let challenge = self
            .store
            .get(challenge_id)
            .await
            .ok_or(GuardError::NotFound)?;

        if challenge.is_expired_at(Utc::now()) {
            self.store.remove(challenge_id).await;
            return Err(GuardError::Expired);
        }

        let hash = compute_hash(&challenge.nonce, solution);
        if !meets_difficulty(&hash, challenge.difficulty) {
            tracing::debug!(challenge_id = %challenge_id, "PoW solution rejected");
            return Ok(false);
        }

        // Only the caller that actually evicts the entry wins.
        match self.store.remove(challenge_id).await {
            Some(_) => {
                tracing::debug!(challenge_id = %challenge_id, "PoW solution accepted");
                Ok(true)
            }
            None => Err(GuardError::NotFound),
        }
    }

    /// Public challenge data, if still outstanding
    pub async fn get_challenge(&self, challenge_id: &str) -> Result<PowChallenge, GuardError> {
        self.store
            .get(challenge_id)
            .await
            .ok_or(GuardError::NotFound)
    }

    /// Difficulty applied to challenges issued from now on
    pub fn set_difficulty(&self, difficulty: u32) {
        let previous = self.difficulty.swap(difficulty, Ordering::Relaxed);
        if previous != difficulty {
            tracing::info!(from = previous, to = difficulty, "PoW difficulty changed");
        }
    }

    pub fn difficulty(&self) -> u32 {
        self.difficulty.load(Ordering::Relaxed)
    }

    pub async fn stats(&self) -> PowStats {
        PowStats {
            active_challenges: self.store.len().await,
            difficulty: self.difficulty(),
        }
    }

    /// Evict expired challenges now
    pub async fn sweep(&self) -> usize {
        let evicted = self.store.sweep(Utc::now()).await;
        if evicted > 0 {
            tracing::debug!(evicted, "Swept expired PoW challenges");
        }
        evicted
    }

    /// Start the periodic expiry sweep
    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let pow = Arc::clone(self);
        spawn_periodic("pow-sweep", self.sweep_interval, token, move || {
            let pow = Arc::clone(&pow);
            async move {
                pow.sweep().await;
            }
        })
    }
}

/// Lowercase hex SHA-256 of `nonce || solution`
pub fn compute_hash(nonce: &str, solution: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(nonce.as_bytes());
    hasher.update(solution.as_bytes());
    hex::encode(hasher.finalize())
}

/// True if `hash` starts with at least `difficulty` `'0'` digits
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.as_bytes()[..difficulty].iter().all(|&b| b == b'0')
}

fn generate_id_and_nonce() -> (String, String) {
    let mut rng = rand::rng();
    let nonce: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(NONCE_LEN)
        .map(char::from)
        .collect();
    let suffix: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();

    (format!("{POW_CHALLENGE_PREFIX}{nanos}_{suffix}"), nonce)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pow::solve_challenge;
    use chrono::TimeDelta;

    #[tokio::test]
    async fn test_generate_and_verify_challenge() {
        let pow = ProofOfWork::new(3);

        let challenge = pow.issue_challenge().await;
        assert_eq!(challenge.difficulty, 3);
        assert_eq!(challenge.nonce.len(), NONCE_LEN);

        let solution = solve_challenge(&challenge.nonce, challenge.difficulty).unwrap();
        assert!(pow.verify(&challenge.challenge_id, &solution).await.unwrap());

        // Consumed: both lookup and re-verify report not found
        assert!(matches!(
            pow.get_challenge(&challenge.challenge_id).await,
            Err(GuardError::NotFound)
        ));
        assert!(matches!(
            pow.verify(&challenge.challenge_id, &solution).await,
            Err(GuardError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_wrong_solution_keeps_challenge() {
        let pow = ProofOfWork::new(6);
        let challenge = pow.issue_challenge().await;

        // Find a candidate that definitely misses the target
        let wrong = (0..)
            .map(|i| i.to_string())
            .find(|s| !meets_difficulty(&compute_hash(&challenge.nonce, s), 6))
            .unwrap();

        assert!(!pow.verify(&challenge.challenge_id, &wrong).await.unwrap());
        assert!(pow.get_challenge(&challenge.challenge_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_verify_rejects_expired_challenge() {
        let store: Arc<MemoryStore<PowChallenge>> = Arc::new(MemoryStore::new());
        let pow = ProofOfWork::with_store(2, store.clone());
        let mut challenge = pow.issue_challenge().await;

        // Force expiration
        challenge.expires_at = Utc::now() - TimeDelta::minutes(1);
        store
            .insert(challenge.challenge_id.clone(), challenge.clone())
            .await;

        let solution = solve_challenge(&challenge.nonce, challenge.difficulty).unwrap();
        assert!(matches!(
            pow.verify(&challenge.challenge_id, &solution).await,
            Err(GuardError::Expired)
        ));
        // Evicted on expiry detection
        assert!(store.get(&challenge.challenge_id).await.is_none());
    }

    #[tokio::test]
    async fn test_outstanding_challenges_keep_issued_difficulty() {
        let pow = ProofOfWork::new(1);
        let easy = pow.issue_challenge().await;

        pow.set_difficulty(5);
        assert_eq!(pow.difficulty(), 5);

        let stored = pow.get_challenge(&easy.challenge_id).await.unwrap();
        assert_eq!(stored.difficulty, 1);

        let solution = solve_challenge(&easy.nonce, 1).unwrap();
        assert!(pow.verify(&easy.challenge_id, &solution).await.unwrap());
    }

    #[tokio::test]
    async fn test_sweep_and_stats() {
        let pow = ProofOfWork::new(2).with_challenge_ttl(Duration::ZERO);
        pow.issue_challenge().await;
        pow.issue_challenge().await;
        assert_eq!(pow.stats().await.active_challenges, 2);

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(pow.sweep().await, 2);
        assert_eq!(
            pow.stats().await,
            PowStats {
                active_challenges: 0,
                difficulty: 2
            }
        );
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("000abc", 3));
        assert!(!meets_difficulty("00abc0", 3));
        assert!(meets_difficulty("abc", 0));
        assert!(!meets_difficulty("00", 3));
    }

    #[test]
    fn test_zero_difficulty_uses_default() {
        assert_eq!(ProofOfWork::new(0).difficulty(), DEFAULT_POW_DIFFICULTY);
    }
}
