//! Admission pipeline: detector, quotas, CAPTCHA and proof-of-work in order.
//!
//! Each engine is consulted sequentially and holds its own lock only for the
//! duration of its call. Check and record are separate steps, so two
//! concurrent requests may both pass a quota that has one slot left; the
//! detector's hourly and daily caps bound that overshoot.

use std::sync::Arc;

use chrono::Utc;
use gatehouse_common::{
    Admission, AdmissionRequest, GuardError, LimitScope, Outcome, RequestMetrics,
};
use serde::{Deserialize, Serialize};

use crate::abuse::{
    AbuseDetector, REASON_ADDRESS_BLOCKED, REASON_DAILY_LIMIT, REASON_HOURLY_LIMIT,
    REASON_IP_BLOCKED, REASON_SUBNET,
};
use crate::captcha::CaptchaService;
use crate::metrics::MetricsAggregator;
use crate::pow::ProofOfWork;
use crate::ratelimit::{Limiter, limit_key};
use crate::telemetry::Telemetry;

/// Behaviour when the counter store cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreFailurePolicy {
    /// Reject the request with `StoreUnavailable`
    #[default]
    FailClosed,
    /// Log and skip rate limiting
    FailOpen,
}

pub struct AdmissionPipeline {
    detector: Arc<AbuseDetector>,
    limiter: Arc<dyn Limiter>,
    captcha: Arc<CaptchaService>,
    pow: Arc<ProofOfWork>,
    metrics: Arc<MetricsAggregator>,
    telemetry: Option<Arc<Telemetry>>,
    policy: StoreFailurePolicy,
    require_captcha: bool,
    require_pow: bool,
}

impl AdmissionPipeline {
    pub fn new(
        detector: Arc<AbuseDetector>,
        limiter: Arc<dyn Limiter>,
        captcha: Arc<CaptchaService>,
        pow: Arc<ProofOfWork>,
        metrics: Arc<MetricsAggregator>,
    ) -> Self {
        Self {
            detector,
            limiter,
            captcha,
            pow,
            metrics,
            telemetry: None,
            policy: StoreFailurePolicy::default(),
            require_captcha: true,
            require_pow: true,
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn require_captcha(mut self, required: bool) -> Self {
        self.require_captcha = required;
        self
    }

    pub fn require_pow(mut self, required: bool) -> Self {
        self.require_pow = required;
        self
    }

    /// Decide whether `req` may perform its external action
    pub async fn admit(&self, req: &AdmissionRequest) -> Result<Admission, GuardError> {
        if req.ip.trim().is_empty() || req.address.trim().is_empty() {
            return Err(GuardError::InvalidInput("ip and address are required".into()));
        }

        let detection = self.detector.check_request(&req.ip, &req.address).await;
        if !detection.allowed {
            let reason = detection.reason.unwrap_or_default();
            tracing::warn!(ip = %req.ip, address = %req.address, reason = %reason, "Request blocked");
            self.metrics.record_blocked(&req.ip).await;
            if let Some(telemetry) = &self.telemetry {
                telemetry.record_blocked(block_label(&reason));
            }
            return Err(GuardError::Blocked {
                reason,
                until: detection.blocked_until,
            });
        }

        self.enforce_quota(LimitScope::Ip, &req.ip).await?;
        self.enforce_quota(LimitScope::Address, &req.address).await?;

        if self.require_captcha {
            self.check_captcha(req).await?;
        }
        if self.require_pow {
            self.check_pow(req).await?;
        }

        tracing::debug!(
            ip = %req.ip,
            address = %req.address,
            risk = detection.risk_score,
            "Request admitted"
        );

        Ok(Admission {
            risk_score: detection.risk_score,
            recommended_delay: detection.recommended_delay,
            notice: detection.reason,
        })
    }

    /// Record what happened after an admitted request ran.
    /// Quota counters only move on success.
    pub async fn report(&self, req: &AdmissionRequest, outcome: &Outcome) -> Result<(), GuardError> {
        self.detector
            .record_attempt(&req.ip, &req.address, outcome.success)
            .await;

        self.metrics
            .record_request(RequestMetrics {
                ip: req.ip.clone(),
                address: req.address.clone(),
                amount: outcome.amount,
                success: outcome.success,
                error_type: outcome.error_type.clone(),
                response_time: outcome.response_time,
                timestamp: Utc::now(),
                captcha_solved: req.captcha_id.is_some(),
                pow_completed: req.pow_challenge_id.is_some(),
            })
            .await;

        if outcome.success {
            // Both quotas move even when one store write fails.
            let ip = self.tolerate_store(self.limiter.increment_ip_counter(&req.ip).await);
            let address =
                self.tolerate_store(self.limiter.increment_address_counter(&req.address).await);
            ip?;
            address?;
        }

        Ok(())
    }

    async fn enforce_quota(&self, scope: LimitScope, value: &str) -> Result<(), GuardError> {
        let limited = match scope {
            LimitScope::Ip => self.limiter.check_ip_limit(value).await,
            LimitScope::Address => self.limiter.check_address_limit(value).await,
        };

        match self.tolerate_store(limited)? {
            Some(true) => {
                let retry_after = self
                    .limiter
                    .remaining_time(&limit_key(scope, value))
                    .await
                    .ok()
                    .flatten();
                if let Some(telemetry) = &self.telemetry {
                    telemetry.record_rate_limit_hit(&scope.to_string());
                }
                tracing::debug!(scope = %scope, value = %value, "Rate limit hit");
                Err(GuardError::RateLimited { scope, retry_after })
            }
            _ => Ok(()),
        }
    }

    /// Apply the store failure policy. `None` means the store was skipped.
    fn tolerate_store<T>(&self, result: Result<T, GuardError>) -> Result<Option<T>, GuardError> {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(GuardError::StoreUnavailable(msg)) if self.policy == StoreFailurePolicy::FailOpen => {
                tracing::warn!(error = %msg, "Counter store unavailable, skipping rate limit");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn check_captcha(&self, req: &AdmissionRequest) -> Result<(), GuardError> {
        let (Some(id), Some(answer)) = (&req.captcha_id, &req.captcha_answer) else {
            return Err(GuardError::CaptchaFailed);
        };

        let solved = self.captcha.validate(id, answer).await;
        if let Some(telemetry) = &self.telemetry {
            telemetry.record_captcha(solved);
        }
        if solved {
            Ok(())
        } else {
            Err(GuardError::CaptchaFailed)
        }
    }

    async fn check_pow(&self, req: &AdmissionRequest) -> Result<(), GuardError> {
        let (Some(id), Some(solution)) = (&req.pow_challenge_id, &req.pow_solution) else {
            return Err(GuardError::PowRequired);
        };

        match self.pow.verify(id, solution).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::debug!(ip = %req.ip, challenge_id = %id, "Proof-of-work solution rejected");
                Err(GuardError::PowRejected)
            }
            Err(e) => {
                tracing::debug!(ip = %req.ip, challenge_id = %id, error = %e, "Proof-of-work challenge invalid");
                Err(e)
            }
        }
    }
}

/// Low-cardinality label for a detector denial reason
fn block_label(reason: &str) -> &'static str {
    match reason {
        REASON_IP_BLOCKED => "ip_blocked",
        REASON_ADDRESS_BLOCKED => "address_blocked",
        REASON_HOURLY_LIMIT => "hourly_limit",
        REASON_DAILY_LIMIT => "daily_limit",
        REASON_SUBNET => "subnet",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::captcha::CaptchaOptions;
    use crate::config::AbuseConfig;
    use crate::pow::solve_challenge;

    /// Limiter double with fixed answers
    #[derive(Default)]
    struct StubLimiter {
        ip_limited: bool,
        address_limited: bool,
        down: bool,
        ip_counter_down: bool,
        increments: AtomicU32,
        address_increments: AtomicU32,
    }

    impl StubLimiter {
        fn answer(&self, limited: bool) -> Result<bool, GuardError> {
            if self.down {
                Err(GuardError::StoreUnavailable("stub down".into()))
            } else {
                Ok(limited)
            }
        }

        fn bump(&self) -> Result<(), GuardError> {
            if self.down {
                return Err(GuardError::StoreUnavailable("stub down".into()));
            }
            self.increments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[async_trait]
    impl Limiter for StubLimiter {
        async fn check_ip_limit(&self, _: &str) -> Result<bool, GuardError> {
            self.answer(self.ip_limited)
        }
        async fn check_address_limit(&self, _: &str) -> Result<bool, GuardError> {
            self.answer(self.address_limited)
        }
        async fn increment_ip_counter(&self, _: &str) -> Result<(), GuardError> {
            if self.ip_counter_down {
                return Err(GuardError::StoreUnavailable("stub ip counter down".into()));
            }
            self.bump()
        }
        async fn increment_address_counter(&self, _: &str) -> Result<(), GuardError> {
            self.bump()?;
            self.address_increments.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn remaining_time(&self, _: &str) -> Result<Option<Duration>, GuardError> {
            Ok(Some(Duration::from_secs(42)))
        }
        async fn current_count(&self, _: &str) -> Result<i64, GuardError> {
            Ok(i64::from(self.increments.load(Ordering::SeqCst)))
        }
    }

    struct Harness {
        pipeline: AdmissionPipeline,
        detector: Arc<AbuseDetector>,
        captcha: Arc<CaptchaService>,
        pow: Arc<ProofOfWork>,
        metrics: Arc<MetricsAggregator>,
        limiter: Arc<StubLimiter>,
    }

    fn harness(limiter: StubLimiter) -> Harness {
        let detector = Arc::new(AbuseDetector::new(AbuseConfig::default()));
        let captcha = Arc::new(CaptchaService::new(CaptchaOptions::default()));
        let pow = Arc::new(ProofOfWork::new(1));
        let metrics = Arc::new(MetricsAggregator::new());
        let limiter = Arc::new(limiter);

        let pipeline = AdmissionPipeline::new(
            Arc::clone(&detector),
            limiter.clone(),
            Arc::clone(&captcha),
            Arc::clone(&pow),
            Arc::clone(&metrics),
        );

        Harness {
            pipeline,
            detector,
            captcha,
            pow,
            metrics,
            limiter,
        }
    }

    async fn solved_request(h: &Harness) -> AdmissionRequest {
        let captcha = h.captcha.generate().await.unwrap();
        let pow = h.pow.issue_challenge().await;
        let solution = solve_challenge(&pow.nonce, pow.difficulty).unwrap();

        AdmissionRequest {
            ip: "198.51.100.20".into(),
            address: "addr-1".into(),
            captcha_id: Some(captcha.challenge_id),
            captcha_answer: Some(captcha.solution),
            pow_challenge_id: Some(pow.challenge_id),
            pow_solution: Some(solution),
        }
    }

    #[tokio::test]
    async fn test_admit_then_report_success() {
        let h = harness(StubLimiter::default());
        let req = solved_request(&h).await;

        let admission = h.pipeline.admit(&req).await.unwrap();
        assert_eq!(admission.risk_score, 0);

        let outcome = Outcome {
            success: true,
            amount: 500,
            error_type: None,
            response_time: Duration::from_millis(30),
        };
        h.pipeline.report(&req, &outcome).await.unwrap();

        assert_eq!(h.limiter.increments.load(Ordering::SeqCst), 2);
        let summary = h.metrics.summary().await;
        assert_eq!(summary.successful_requests, 1);
        assert_eq!(summary.total_tokens_distributed, 500);
        assert_eq!(h.detector.stats().await.successful_attempts, 1);
    }

    #[tokio::test]
    async fn test_failed_outcome_leaves_quota_untouched() {
        let h = harness(StubLimiter::default());
        let req = solved_request(&h).await;

        let outcome = Outcome {
            success: false,
            error_type: Some("broadcast_failed".into()),
            ..Default::default()
        };
        h.pipeline.report(&req, &outcome).await.unwrap();

        assert_eq!(h.limiter.increments.load(Ordering::SeqCst), 0);
        assert_eq!(h.metrics.summary().await.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_blocked_ip_is_recorded() {
        let h = harness(StubLimiter::default());
        h.detector.block_ip("198.51.100.20", None).await;
        let req = solved_request(&h).await;

        let err = h.pipeline.admit(&req).await.unwrap_err();
        assert!(matches!(err, GuardError::Blocked { until: Some(_), .. }));
        assert_eq!(err.public_message(), REASON_IP_BLOCKED);
        assert_eq!(h.metrics.summary().await.blocked_requests, 1);
    }

    #[tokio::test]
    async fn test_rate_limits_by_scope() {
        let h = harness(StubLimiter {
            ip_limited: true,
            ..Default::default()
        });
        let req = solved_request(&h).await;
        let err = h.pipeline.admit(&req).await.unwrap_err();
        assert!(matches!(
            err,
            GuardError::RateLimited {
                scope: LimitScope::Ip,
                retry_after: Some(_)
            }
        ));

        let h = harness(StubLimiter {
            address_limited: true,
            ..Default::default()
        });
        let req = solved_request(&h).await;
        let err = h.pipeline.admit(&req).await.unwrap_err();
        assert!(matches!(
            err,
            GuardError::RateLimited {
                scope: LimitScope::Address,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_store_failure_policy() {
        let h = harness(StubLimiter {
            down: true,
            ..Default::default()
        });
        let req = solved_request(&h).await;
        let err = h.pipeline.admit(&req).await.unwrap_err();
        assert!(matches!(err, GuardError::StoreUnavailable(_)));

        let h = harness(StubLimiter {
            down: true,
            ..Default::default()
        });
        let pipeline = h.pipeline.with_policy(StoreFailurePolicy::FailOpen);
        let req = AdmissionRequest {
            ip: "198.51.100.21".into(),
            address: "addr-2".into(),
            ..Default::default()
        };
        let pipeline = pipeline.require_captcha(false).require_pow(false);
        assert!(pipeline.admit(&req).await.is_ok());
        assert!(pipeline.report(&req, &Outcome { success: true, ..Default::default() }).await.is_ok());
    }

    #[tokio::test]
    async fn test_ip_counter_failure_still_moves_address_quota() {
        let h = harness(StubLimiter {
            ip_counter_down: true,
            ..Default::default()
        });
        let req = solved_request(&h).await;

        let err = h
            .pipeline
            .report(&req, &Outcome { success: true, ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, GuardError::StoreUnavailable(_)));
        assert_eq!(h.limiter.address_increments.load(Ordering::SeqCst), 1);
        assert_eq!(h.metrics.summary().await.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_captcha_failures() {
        let h = harness(StubLimiter::default());
        let mut req = solved_request(&h).await;
        req.captcha_answer = Some("WRONG!".into());
        assert!(matches!(h.pipeline.admit(&req).await, Err(GuardError::CaptchaFailed)));

        let mut req = solved_request(&h).await;
        req.captcha_id = None;
        assert!(matches!(h.pipeline.admit(&req).await, Err(GuardError::CaptchaFailed)));
    }

    #[tokio::test]
    async fn test_pow_failures() {
        let h = harness(StubLimiter::default());

        let mut req = solved_request(&h).await;
        req.pow_solution = None;
        assert!(matches!(h.pipeline.admit(&req).await, Err(GuardError::PowRequired)));

        let mut req = solved_request(&h).await;
        req.pow_challenge_id = Some("pow_unknown".into());
        assert!(matches!(h.pipeline.admit(&req).await, Err(GuardError::NotFound)));
    }

    #[tokio::test]
    async fn test_wrong_pow_solution_rejected() {
        let h = harness(StubLimiter::default());
        h.pow.set_difficulty(8);
        let mut req = unsolved_request(&h).await;
        // Eight leading zeros are out of reach for a fixed guess.
        req.pow_solution = Some("not-a-solution".into());
        let err = h.pipeline.admit(&req).await.unwrap_err();
        assert!(matches!(err, GuardError::PowRejected));
        assert_eq!(err.public_message(), GuardError::NotFound.public_message());
    }

    async fn unsolved_request(h: &Harness) -> AdmissionRequest {
        let captcha = h.captcha.generate().await.unwrap();
        let pow = h.pow.issue_challenge().await;
        AdmissionRequest {
            ip: "198.51.100.22".into(),
            address: "addr-3".into(),
            captcha_id: Some(captcha.challenge_id),
            captcha_answer: Some(captcha.solution),
            pow_challenge_id: Some(pow.challenge_id),
            pow_solution: None,
        }
    }

    #[tokio::test]
    async fn test_missing_identity_is_invalid() {
        let h = harness(StubLimiter::default());
        let req = AdmissionRequest::default();
        assert!(matches!(h.pipeline.admit(&req).await, Err(GuardError::InvalidInput(_))));
    }

    #[test]
    fn test_block_labels() {
        assert_eq!(block_label(REASON_SUBNET), "subnet");
        assert_eq!(block_label("something new"), "other");
    }
}
