//! Application state and shared resources.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::abuse::AbuseDetector;
use crate::captcha::{CaptchaOptions, CaptchaService};
use crate::config::AppConfig;
use crate::metrics::MetricsAggregator;
use crate::pipeline::AdmissionPipeline;
use crate::pow::{AdaptiveDifficulty, ProofOfWork};
use crate::ratelimit::RateLimiter;
use crate::store::{CounterStore, MemoryCounterStore, RedisCounterStore};
use crate::telemetry::Telemetry;

/// How often the adaptive controller samples request load
const LOAD_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,

    /// Rate limit counters (Redis or in-memory)
    pub counters: Arc<dyn CounterStore>,

    pub pow: Arc<ProofOfWork>,

    /// Present when adaptive difficulty is enabled
    pub adaptive: Option<Arc<AdaptiveDifficulty>>,

    pub captcha: Arc<CaptchaService>,
    pub detector: Arc<AbuseDetector>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsAggregator>,
    pub telemetry: Arc<Telemetry>,
    pub pipeline: Arc<AdmissionPipeline>,
}

impl AppState {
    /// Create application state, connecting to Redis when configured
    pub async fn new(config: AppConfig) -> Result<Self> {
        let counters: Arc<dyn CounterStore> = match &config.redis_url {
            Some(url) => {
                let store = RedisCounterStore::connect(url, config.store_timeout)
                    .await
                    .context("Failed to connect to Redis")?;
                tracing::info!(url = %url, "Redis counter store connected");
                Arc::new(store)
            }
            None => {
                tracing::info!("No Redis configured, using in-memory counters");
                Arc::new(MemoryCounterStore::new())
            }
        };

        Self::with_counter_store(config, counters)
    }

    /// Wire every engine around an existing counter store
    pub fn with_counter_store(config: AppConfig, counters: Arc<dyn CounterStore>) -> Result<Self> {
        let telemetry = Arc::new(Telemetry::new().context("Failed to register metrics")?);

        let pow = Arc::new(
            ProofOfWork::new(config.pow.difficulty)
                .with_challenge_ttl(config.pow.challenge_ttl)
                .with_sweep_interval(config.pow.sweep_interval),
        );
        telemetry.set_pow_difficulty(pow.difficulty());

        let adaptive = config.pow.adaptive.then(|| {
            Arc::new(AdaptiveDifficulty::with_baseline(
                Arc::clone(&pow),
                pow.difficulty(),
                config.pow.baseline_load,
            ))
        });

        let captcha = Arc::new(
            CaptchaService::new(CaptchaOptions::from(&config.captcha))
                .with_sweep_interval(config.captcha.sweep_interval),
        );
        let detector = Arc::new(AbuseDetector::new(config.abuse.clone()));
        let limiter = Arc::new(RateLimiter::from_config(
            Arc::clone(&counters),
            &config.rate_limit,
        ));
        let metrics = Arc::new(MetricsAggregator::new().with_telemetry(Arc::clone(&telemetry)));

        let pipeline = Arc::new(
            AdmissionPipeline::new(
                Arc::clone(&detector),
                limiter.clone(),
                Arc::clone(&captcha),
                Arc::clone(&pow),
                Arc::clone(&metrics),
            )
            .with_telemetry(Arc::clone(&telemetry))
            .with_policy(config.store_failure_policy)
            .require_captcha(config.captcha.required)
            .require_pow(config.pow.required),
        );

        Ok(Self {
            config: Arc::new(config),
            counters,
            pow,
            adaptive,
            captcha,
            detector,
            limiter,
            metrics,
            telemetry,
            pipeline,
        })
    }

    /// Start sweeps and the load feed; all stop when `token` is cancelled
    pub fn spawn_background(&self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.pow.spawn_sweeper(token.clone()),
            self.captcha.spawn_sweeper(token.clone()),
            self.detector.spawn_sweeper(token.clone()),
        ];

        if let Some(adaptive) = &self.adaptive {
            handles.push(adaptive.spawn_load_feed(
                Arc::clone(&self.metrics),
                Some(Arc::clone(&self.telemetry)),
                LOAD_SAMPLE_INTERVAL,
                token,
            ));
        }

        tracing::info!(tasks = handles.len(), "Background tasks started");
        handles
    }
}
