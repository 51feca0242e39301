//! Prometheus export of admission outcomes.
//!
//! Metric names follow `gatehouse_<subject>_<unit>`. Each `Telemetry` owns
//! its registry, so several instances can coexist in one process.

use std::time::Duration;

use gatehouse_common::GuardError;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder, exponential_buckets,
};

pub struct Telemetry {
    registry: Registry,
    requests: IntCounterVec,
    tokens_distributed: IntCounter,
    blocked: IntCounterVec,
    rate_limit_hits: IntCounterVec,
    captcha_attempts: IntCounterVec,
    pow_difficulty: IntGauge,
    request_duration: Histogram,
}

impl Telemetry {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests = IntCounterVec::new(
            Opts::new("gatehouse_requests_total", "Admitted requests by outcome"),
            &["status"],
        )?;
        let tokens_distributed = IntCounter::new(
            "gatehouse_tokens_distributed_total",
            "Tokens handed out by successful requests",
        )?;
        let blocked = IntCounterVec::new(
            Opts::new("gatehouse_blocked_requests_total", "Requests denied by the abuse detector"),
            &["reason"],
        )?;
        let rate_limit_hits = IntCounterVec::new(
            Opts::new("gatehouse_rate_limit_hits_total", "Requests rejected by a quota"),
            &["scope"],
        )?;
        let captcha_attempts = IntCounterVec::new(
            Opts::new("gatehouse_captcha_attempts_total", "CAPTCHA validations by result"),
            &["result"],
        )?;
        let pow_difficulty = IntGauge::new(
            "gatehouse_pow_difficulty",
            "Difficulty stamped on newly issued PoW challenges",
        )?;
        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "gatehouse_request_duration_seconds",
                "Time from admission to reported outcome",
            )
            .buckets(exponential_buckets(0.005, 2.0, 12)?),
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(tokens_distributed.clone()))?;
        registry.register(Box::new(blocked.clone()))?;
        registry.register(Box::new(rate_limit_hits.clone()))?;
        registry.register(Box::new(captcha_attempts.clone()))?;
        registry.register(Box::new(pow_difficulty.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            requests,
            tokens_distributed,
            blocked,
            rate_limit_hits,
            captcha_attempts,
            pow_difficulty,
            request_duration,
        })
    }

    pub fn record_request(&self, success: bool, amount: u64, duration: Duration) {
        let status = if success { "success" } else { "failure" };
        self.requests.with_label_values(&[status]).inc();
        if success {
            self.tokens_distributed.inc_by(amount);
        }
        self.request_duration.observe(duration.as_secs_f64());
    }

    pub fn record_blocked(&self, reason: &str) {
        self.blocked.with_label_values(&[reason]).inc();
    }

    pub fn record_rate_limit_hit(&self, scope: &str) {
        self.rate_limit_hits.with_label_values(&[scope]).inc();
    }

    pub fn record_captcha(&self, solved: bool) {
        let result = if solved { "solved" } else { "failed" };
        self.captcha_attempts.with_label_values(&[result]).inc();
    }

    pub fn set_pow_difficulty(&self, difficulty: u32) {
        self.pow_difficulty.set(i64::from(difficulty));
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, GuardError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| GuardError::Internal(format!("metrics encoding failed: {e}")))?;
        String::from_utf8(buffer)
            .map_err(|e| GuardError::Internal(format!("metrics encoding failed: {e}")))
    }
}
