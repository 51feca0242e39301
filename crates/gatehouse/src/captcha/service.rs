//! CAPTCHA challenge issuance and one-time validation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use gatehouse_common::constants::{CAPTCHA_SWEEP_INTERVAL_SECS, CAPTCHA_TTL_SECS};
use gatehouse_common::{CaptchaChallenge, CaptchaDifficulty, GuardError};
use rand::Rng;
use serde::Serialize;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::render::CaptchaRenderer;
use crate::clock::deadline;
use crate::config::CaptchaConfig;
use crate::store::{ChallengeStore, MemoryStore};
use crate::tasks::spawn_periodic;

const DEFAULT_LENGTH: usize = 6;
const DEFAULT_WIDTH: u32 = 200;
const DEFAULT_HEIGHT: u32 = 80;

/// Generation parameters. Zero values fall back to defaults.
#[derive(Debug, Clone)]
pub struct CaptchaOptions {
    pub length: usize,
    pub width: u32,
    pub height: u32,
    pub ttl: Duration,
    pub difficulty: CaptchaDifficulty,
    pub font_path: Option<String>,
}

impl Default for CaptchaOptions {
    fn default() -> Self {
        Self {
            length: DEFAULT_LENGTH,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            ttl: Duration::from_secs(CAPTCHA_TTL_SECS),
            difficulty: CaptchaDifficulty::default(),
            font_path: None,
        }
    }
}

impl From<&CaptchaConfig> for CaptchaOptions {
    fn from(config: &CaptchaConfig) -> Self {
        Self {
            length: config.length,
            width: config.width,
            height: config.height,
            ttl: config.ttl,
            difficulty: config.difficulty,
            font_path: config.font_path.clone(),
        }
    }
}

impl CaptchaOptions {
    fn normalized(mut self) -> Self {
        if self.length == 0 {
            self.length = DEFAULT_LENGTH;
        }
        if self.width == 0 {
            self.width = DEFAULT_WIDTH;
        }
        if self.height == 0 {
            self.height = DEFAULT_HEIGHT;
        }
        if self.ttl.is_zero() {
            self.ttl = Duration::from_secs(CAPTCHA_TTL_SECS);
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptchaStats {
    pub active_challenges: usize,
    pub difficulty: CaptchaDifficulty,
}

/// CAPTCHA service
pub struct CaptchaService {
    store: Arc<dyn ChallengeStore<CaptchaChallenge>>,
    renderer: CaptchaRenderer,
    options: CaptchaOptions,
    sweep_interval: Duration,
}

impl CaptchaService {
    pub fn new(options: CaptchaOptions) -> Self {
        Self::with_store(options, Arc::new(MemoryStore::new()))
    }

    pub fn with_store(
        options: CaptchaOptions,
        store: Arc<dyn ChallengeStore<CaptchaChallenge>>,
    ) -> Self {
        let options = options.normalized();
        let mut renderer = CaptchaRenderer::new(options.width, options.height);

        // An unusable font degrades to the built-in face rather than failing startup.
        if let Some(path) = &options.font_path {
            match CaptchaRenderer::load_font(Path::new(path)) {
                Ok(font) => renderer = renderer.with_font(font),
                Err(e) => tracing::warn!(error = %e, "Falling back to built-in CAPTCHA glyphs"),
            }
        }

        Self {
            store,
            renderer,
            options,
            sweep_interval: Duration::from_secs(CAPTCHA_SWEEP_INTERVAL_SECS),
        }
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Generate, render and store a new challenge
    pub async fn generate(&self) -> Result<CaptchaChallenge, GuardError> {
        let difficulty = self.options.difficulty;
        let solution = random_solution(difficulty.alphabet(), self.options.length);
        let image_png = self.renderer.render(&solution, difficulty)?;

        let now = Utc::now();
        let challenge = CaptchaChallenge {
            challenge_id: generate_challenge_id(),
            solution,
            image_png,
            difficulty,
            created_at: now,
            expires_at: deadline(now, self.options.ttl),
        };

        self.store
            .insert(challenge.challenge_id.clone(), challenge.clone())
            .await;

        tracing::debug!(
            challenge_id = %challenge.challenge_id,
            difficulty = ?difficulty,
            "Generated CAPTCHA challenge"
        );

        Ok(challenge)
    }

    /// Check `candidate` against a stored challenge. The challenge is
    /// consumed whatever the outcome.
    pub async fn validate(&self, challenge_id: &str, candidate: &str) -> bool {
        let Some(challenge) = self.store.remove(challenge_id).await else {
            tracing::debug!(challenge_id = %challenge_id, "Unknown CAPTCHA challenge");
            return false;
        };

        if challenge.is_expired_at(Utc::now()) {
            tracing::debug!(challenge_id = %challenge_id, "CAPTCHA challenge expired");
            return false;
        }

        let success = answers_match(&challenge.solution, candidate, challenge.difficulty);
        if success {
            tracing::debug!(challenge_id = %challenge_id, "CAPTCHA solved");
        } else {
            tracing::debug!(challenge_id = %challenge_id, "CAPTCHA answer rejected");
        }
        success
    }

    pub async fn stats(&self) -> CaptchaStats {
        CaptchaStats {
            active_challenges: self.store.len().await,
            difficulty: self.options.difficulty,
        }
    }

    /// Drop expired challenges, returning how many went
    pub async fn sweep(&self) -> usize {
        let removed = self.store.sweep(Utc::now()).await;
        if removed > 0 {
            tracing::debug!(removed, "Swept expired CAPTCHA challenges");
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        spawn_periodic("captcha-sweep", self.sweep_interval, token, move || {
            let service = Arc::clone(&service);
            async move {
                service.sweep().await;
            }
        })
    }
}

fn random_solution(alphabet: &[u8], length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

fn generate_challenge_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Easy and medium solutions are drawn from uppercase-only alphabets, so the
/// candidate is uppercased first. Hard compares exactly.
fn answers_match(solution: &str, candidate: &str, difficulty: CaptchaDifficulty) -> bool {
    let candidate = if difficulty.case_sensitive() {
        candidate.to_string()
    } else {
        candidate.to_uppercase()
    };
    solution.as_bytes().ct_eq(candidate.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(options: CaptchaOptions) -> CaptchaService {
        CaptchaService::new(options)
    }

    #[tokio::test]
    async fn test_solution_has_configured_length_and_alphabet() {
        let svc = service(CaptchaOptions {
            length: 8,
            ..Default::default()
        });
        let challenge = svc.generate().await.unwrap();

        assert_eq!(challenge.solution.len(), 8);
        let alphabet = CaptchaDifficulty::Medium.alphabet();
        assert!(challenge.solution.bytes().all(|b| alphabet.contains(&b)));
        assert_eq!(&challenge.image_png[1..4], b"PNG");
    }

    #[tokio::test]
    async fn test_validation_is_one_time() {
        let svc = service(CaptchaOptions::default());
        let challenge = svc.generate().await.unwrap();

        assert!(svc.validate(&challenge.challenge_id, &challenge.solution).await);
        assert!(!svc.validate(&challenge.challenge_id, &challenge.solution).await);
    }

    #[tokio::test]
    async fn test_wrong_answer_still_consumes() {
        let svc = service(CaptchaOptions::default());
        let challenge = svc.generate().await.unwrap();

        assert!(!svc.validate(&challenge.challenge_id, "nope").await);
        assert!(!svc.validate(&challenge.challenge_id, &challenge.solution).await);
        assert_eq!(svc.stats().await.active_challenges, 0);
    }

    #[tokio::test]
    async fn test_expired_challenge_fails() {
        let svc = service(CaptchaOptions {
            ttl: Duration::from_millis(50),
            ..Default::default()
        });
        let challenge = svc.generate().await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!svc.validate(&challenge.challenge_id, &challenge.solution).await);
    }

    #[tokio::test]
    async fn test_medium_tier_ignores_case() {
        let svc = service(CaptchaOptions::default());
        let challenge = svc.generate().await.unwrap();

        let lowered = challenge.solution.to_lowercase();
        assert!(svc.validate(&challenge.challenge_id, &lowered).await);
    }

    #[test]
    fn test_hard_tier_is_case_sensitive() {
        assert!(answers_match("aB3", "aB3", CaptchaDifficulty::Hard));
        assert!(!answers_match("aB3", "AB3", CaptchaDifficulty::Hard));
        assert!(!answers_match("AB3", "AB", CaptchaDifficulty::Easy));
    }

    #[tokio::test]
    async fn test_sweep_drops_expired() {
        let svc = service(CaptchaOptions {
            ttl: Duration::from_millis(20),
            ..Default::default()
        });
        svc.generate().await.unwrap();
        svc.generate().await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.sweep().await, 2);
        assert_eq!(svc.stats().await.active_challenges, 0);
    }

    #[test]
    fn test_zero_options_fall_back_to_defaults() {
        let opts = CaptchaOptions {
            length: 0,
            width: 0,
            height: 0,
            ttl: Duration::ZERO,
            ..Default::default()
        }
        .normalized();
        assert_eq!((opts.length, opts.width, opts.height), (6, 200, 80));
        assert_eq!(opts.ttl, Duration::from_secs(300));
    }
}
