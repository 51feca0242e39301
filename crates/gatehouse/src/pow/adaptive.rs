//! Load-driven difficulty adjustment.

use std::sync::Arc;
use std::time::Duration;

use gatehouse_common::constants::DEFAULT_BASELINE_LOAD;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::ProofOfWork;
use crate::metrics::MetricsAggregator;
use crate::tasks::spawn_periodic;
use crate::telemetry::Telemetry;

/// Retunes a [`ProofOfWork`] engine within `[base - 1, base + 2]`
pub struct AdaptiveDifficulty {
    pow: Arc<ProofOfWork>,
    base_difficulty: u32,
    min_difficulty: u32,
    max_difficulty: u32,
    baseline_load: f64,
    current_load: RwLock<f64>,
}

impl AdaptiveDifficulty {
    pub fn new(pow: Arc<ProofOfWork>, base_difficulty: u32) -> Self {
        Self::with_baseline(pow, base_difficulty, DEFAULT_BASELINE_LOAD)
    }

    pub fn with_baseline(pow: Arc<ProofOfWork>, base_difficulty: u32, baseline_load: f64) -> Self {
        Self {
            pow,
            base_difficulty,
            min_difficulty: base_difficulty.saturating_sub(1).max(1),
            max_difficulty: base_difficulty + 2,
            baseline_load,
            current_load: RwLock::new(baseline_load),
        }
    }

    /// Ingest a load sample and push the resulting difficulty into the engine
    pub async fn update_load(&self, load: f64) -> u32 {
        *self.current_load.write().await = load;

        let target = if load > self.baseline_load * 1.5 {
            self.base_difficulty + 2
        } else if load > self.baseline_load * 1.2 {
            self.base_difficulty + 1
        } else if load < self.baseline_load * 0.5 {
            self.base_difficulty.saturating_sub(1)
        } else {
            self.base_difficulty
        };
        let difficulty = target.clamp(self.min_difficulty, self.max_difficulty);

        self.pow.set_difficulty(difficulty);
        difficulty
    }

    pub fn current_difficulty(&self) -> u32 {
        self.pow.difficulty()
    }

    pub async fn current_load(&self) -> f64 {
        *self.current_load.read().await
    }

    /// Sample requests-per-minute from `metrics` every `period` and feed it in
    pub fn spawn_load_feed(
        self: &Arc<Self>,
        metrics: Arc<MetricsAggregator>,
        telemetry: Option<Arc<Telemetry>>,
        period: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let adaptive = Arc::clone(self);

        spawn_periodic("pow-load-feed", period, token, move || {
            let adaptive = Arc::clone(&adaptive);
            let metrics = Arc::clone(&metrics);
            let telemetry = telemetry.clone();
            async move {
                let load = metrics.requests_per_minute().await;

                let difficulty = adaptive.update_load(load).await;
                if let Some(telemetry) = telemetry {
                    telemetry.set_pow_difficulty(difficulty);
                }
                tracing::debug!(load, difficulty, "Adaptive difficulty sampled load");
            }
        })
    }
}
