//! In-process aggregation of request outcomes.
//!
//! Unique addresses and top recipients count successful requests only.
//! Unique IPs include blocked requests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Timelike;
use gatehouse_common::constants::{MAX_RESPONSE_SAMPLES, RETAINED_RESPONSE_SAMPLES};
use gatehouse_common::{PerformanceStats, RecipientStat, RequestMetrics, Summary};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::telemetry::Telemetry;

const SUMMARY_TOP_RECIPIENTS: usize = 10;

/// Span of the trailing request-rate window
const RATE_WINDOW: Duration = Duration::from_secs(60);

struct MetricsState {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    blocked_requests: u64,
    tokens_distributed: u64,

    requests_per_hour: BTreeMap<u32, u64>,
    requests_per_day: BTreeMap<String, u64>,

    unique_addresses: HashSet<String>,
    unique_ips: HashSet<String>,
    /// Recipients in first-seen order
    recipients: Vec<RecipientStat>,
    recipient_index: HashMap<String, usize>,

    response_times: Vec<Duration>,
    response_total: Duration,
    avg_response_time: Duration,
    max_response_time: Duration,

    error_counts: HashMap<String, u64>,
    /// Arrival times inside the trailing rate window, oldest first
    recent: VecDeque<Instant>,
    started: Instant,
}

impl MetricsState {
    fn new() -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            blocked_requests: 0,
            tokens_distributed: 0,
            requests_per_hour: BTreeMap::new(),
            requests_per_day: BTreeMap::new(),
            unique_addresses: HashSet::new(),
            unique_ips: HashSet::new(),
            recipients: Vec::new(),
            recipient_index: HashMap::new(),
            response_times: Vec::with_capacity(RETAINED_RESPONSE_SAMPLES),
            response_total: Duration::ZERO,
            avg_response_time: Duration::ZERO,
            max_response_time: Duration::ZERO,
            error_counts: HashMap::new(),
            recent: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn record_recipient(&mut self, address: &str, amount: u64) {
        match self.recipient_index.get(address) {
            Some(&i) => {
                let stat = &mut self.recipients[i];
                stat.request_count += 1;
                stat.total_amount += amount;
            }
            None => {
                self.recipient_index
                    .insert(address.to_string(), self.recipients.len());
                self.recipients.push(RecipientStat {
                    address: address.to_string(),
                    request_count: 1,
                    total_amount: amount,
                });
            }
        }
    }

    fn record_response_time(&mut self, sample: Duration) {
        self.response_times.push(sample);
        self.response_total += sample;
        self.max_response_time = self.max_response_time.max(sample);
        self.avg_response_time = self.response_total / self.response_times.len() as u32;

        if self.response_times.len() > MAX_RESPONSE_SAMPLES {
            let cut = self.response_times.len() - RETAINED_RESPONSE_SAMPLES;
            self.response_times.drain(..cut);
            self.response_total = self.response_times.iter().sum();
        }
    }

    /// Recipients by descending count; ties keep first-seen order
    fn top_recipients(&self, limit: usize) -> Vec<RecipientStat> {
        let mut sorted = self.recipients.clone();
        sorted.sort_by(|a, b| b.request_count.cmp(&a.request_count));
        sorted.truncate(limit);
        sorted
    }

    fn record_arrival(&mut self, now: Instant) {
        self.recent.push_back(now);
        while self
            .recent
            .front()
            .is_some_and(|&at| now.saturating_duration_since(at) >= RATE_WINDOW)
        {
            self.recent.pop_front();
        }
    }

    fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Request metrics aggregator
pub struct MetricsAggregator {
    state: RwLock<MetricsState>,
    telemetry: Option<Arc<Telemetry>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MetricsState::new()),
            telemetry: None,
        }
    }

    /// Mirror every recorded request into `telemetry`
    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub async fn record_request(&self, metrics: RequestMetrics) {
        {
            let mut state = self.state.write().await;
            state.total_requests += 1;

            if metrics.success {
                state.successful_requests += 1;
                state.tokens_distributed += metrics.amount;
                state.unique_addresses.insert(metrics.address.clone());
                state.record_recipient(&metrics.address, metrics.amount);
            } else {
                state.failed_requests += 1;
                if let Some(error_type) = metrics.error_type.as_deref().filter(|e| !e.is_empty()) {
                    *state.error_counts.entry(error_type.to_string()).or_insert(0) += 1;
                }
            }

            state.unique_ips.insert(metrics.ip.clone());
            state.record_arrival(Instant::now());
            *state
                .requests_per_hour
                .entry(metrics.timestamp.hour())
                .or_insert(0) += 1;
            *state
                .requests_per_day
                .entry(metrics.timestamp.format("%Y-%m-%d").to_string())
                .or_insert(0) += 1;

            state.record_response_time(metrics.response_time);
        }

        if let Some(telemetry) = &self.telemetry {
            telemetry.record_request(metrics.success, metrics.amount, metrics.response_time);
        }
    }

    /// Count a request the detector refused
    pub async fn record_blocked(&self, ip: &str) {
        let mut state = self.state.write().await;
        state.blocked_requests += 1;
        state.unique_ips.insert(ip.to_string());
    }

    pub async fn summary(&self) -> Summary {
        let state = self.state.read().await;

        let uptime_hours = state.uptime().as_secs_f64() / 3600.0;
        let requests_per_hour = if uptime_hours > 0.0 {
            state.total_requests as f64 / uptime_hours
        } else {
            0.0
        };
        let success_rate = if state.total_requests > 0 {
            state.successful_requests as f64 / state.total_requests as f64 * 100.0
        } else {
            0.0
        };
        let avg_tokens_per_request = if state.successful_requests > 0 {
            state.tokens_distributed as f64 / state.successful_requests as f64
        } else {
            0.0
        };

        Summary {
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            blocked_requests: state.blocked_requests,
            success_rate,
            total_tokens_distributed: state.tokens_distributed,
            avg_tokens_per_request,
            unique_addresses: state.unique_addresses.len(),
            unique_ips: state.unique_ips.len(),
            avg_response_time: state.avg_response_time,
            max_response_time: state.max_response_time,
            uptime_hours,
            requests_per_hour,
            top_recipients: state.top_recipients(SUMMARY_TOP_RECIPIENTS),
            error_breakdown: state.error_counts.clone(),
            hourly_distribution: state.requests_per_hour.clone(),
        }
    }

    /// Percentiles over the retained samples, index `floor(q * n)`
    pub async fn performance_stats(&self) -> PerformanceStats {
        let state = self.state.read().await;
        let mut sorted = state.response_times.clone();
        sorted.sort_unstable();

        let percentile = |q: f64| -> Duration {
            if sorted.is_empty() {
                return Duration::ZERO;
            }
            let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
            sorted[idx]
        };

        PerformanceStats {
            avg: state.avg_response_time,
            max: state.max_response_time,
            p50: percentile(0.50),
            p95: percentile(0.95),
            p99: percentile(0.99),
            total_samples: sorted.len(),
        }
    }

    /// Hour of day -> requests
    pub async fn hourly_stats(&self) -> BTreeMap<u32, u64> {
        self.state.read().await.requests_per_hour.clone()
    }

    /// `YYYY-MM-DD` -> requests
    pub async fn daily_stats(&self) -> BTreeMap<String, u64> {
        self.state.read().await.requests_per_day.clone()
    }

    pub async fn error_stats(&self) -> HashMap<String, u64> {
        self.state.read().await.error_counts.clone()
    }

    pub async fn top_recipients(&self, limit: usize) -> Vec<RecipientStat> {
        self.state.read().await.top_recipients(limit)
    }

    pub async fn total_requests(&self) -> u64 {
        self.state.read().await.total_requests
    }

    /// Requests recorded during the last minute
    pub async fn requests_per_minute(&self) -> f64 {
        let now = Instant::now();
        let state = self.state.read().await;
        state
            .recent
            .iter()
            .rev()
            .take_while(|&&at| now.saturating_duration_since(at) < RATE_WINDOW)
            .count() as f64
    }

    /// Clear everything and restart the uptime clock
    pub async fn reset(&self) {
        *self.state.write().await = MetricsState::new();
        tracing::info!("Metrics reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn request(ip: &str, address: &str, success: bool, amount: u64, ms: u64) -> RequestMetrics {
        RequestMetrics {
            ip: ip.into(),
            address: address.into(),
            amount,
            success,
            error_type: (!success).then(|| "insufficient_funds".to_string()),
            response_time: Duration::from_millis(ms),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 14, 30, 0).unwrap(),
            captcha_solved: true,
            pow_completed: true,
        }
    }

    #[tokio::test]
    async fn test_summary_after_success_and_failure() {
        let metrics = MetricsAggregator::new();
        metrics.record_request(request("1.1.1.1", "addr1", true, 1000, 100)).await;
        metrics.record_request(request("2.2.2.2", "addr2", false, 0, 300)).await;

        let summary = metrics.summary().await;
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.successful_requests, 1);
        assert_eq!(summary.failed_requests, 1);
        assert_eq!(summary.success_rate, 50.0);
        assert_eq!(summary.total_tokens_distributed, 1000);
        assert_eq!(summary.avg_tokens_per_request, 1000.0);
        assert_eq!(summary.unique_addresses, 1);
        assert_eq!(summary.unique_ips, 2);
        assert_eq!(summary.avg_response_time, Duration::from_millis(200));
        assert_eq!(summary.max_response_time, Duration::from_millis(300));
        assert_eq!(summary.error_breakdown.get("insufficient_funds"), Some(&1));
        assert_eq!(summary.hourly_distribution.get(&14), Some(&2));
        assert_eq!(metrics.daily_stats().await.get("2024-05-01"), Some(&2));
    }

    #[tokio::test]
    async fn test_blocked_counts_ip_only() {
        let metrics = MetricsAggregator::new();
        metrics.record_blocked("3.3.3.3").await;

        let summary = metrics.summary().await;
        assert_eq!(summary.blocked_requests, 1);
        assert_eq!(summary.total_requests, 0);
        assert_eq!(summary.unique_ips, 1);
    }

    #[tokio::test]
    async fn test_percentiles_use_floor_index() {
        let metrics = MetricsAggregator::new();
        for ms in (1..=100).rev() {
            metrics.record_request(request("1.1.1.1", "a", true, 1, ms)).await;
        }

        let perf = metrics.performance_stats().await;
        assert_eq!(perf.total_samples, 100);
        assert_eq!(perf.p50, Duration::from_millis(51));
        assert_eq!(perf.p95, Duration::from_millis(96));
        assert_eq!(perf.p99, Duration::from_millis(100));
        assert_eq!(perf.max, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_samples_trimmed_to_most_recent() {
        let metrics = MetricsAggregator::new();
        for _ in 0..MAX_RESPONSE_SAMPLES {
            metrics.record_request(request("1.1.1.1", "a", true, 1, 5)).await;
        }
        metrics.record_request(request("1.1.1.1", "a", true, 1, 50)).await;

        let perf = metrics.performance_stats().await;
        assert_eq!(perf.total_samples, RETAINED_RESPONSE_SAMPLES);
        assert_eq!(perf.max, Duration::from_millis(50));
        // 999 retained 5 ms samples precede the single 50 ms one.
        assert_eq!(perf.p99, Duration::from_millis(5));
    }

    #[tokio::test]
    async fn test_top_recipients_stable_order() {
        let metrics = MetricsAggregator::new();
        for addr in ["b", "a", "c", "a"] {
            metrics.record_request(request("1.1.1.1", addr, true, 10, 1)).await;
        }
        metrics.record_request(request("1.1.1.1", "z", false, 0, 1)).await;

        let top = metrics.top_recipients(10).await;
        let order: Vec<_> = top.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(order, ["a", "b", "c"]);
        assert_eq!(top[0].total_amount, 20);
        assert_eq!(metrics.top_recipients(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_error_type_not_counted() {
        let metrics = MetricsAggregator::new();
        let mut failed = request("1.1.1.1", "a", false, 0, 1);
        failed.error_type = Some(String::new());
        metrics.record_request(failed).await;

        assert!(metrics.error_stats().await.is_empty());
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let metrics = MetricsAggregator::new();
        metrics.record_request(request("1.1.1.1", "a", true, 1, 1)).await;
        metrics.record_blocked("2.2.2.2").await;
        metrics.reset().await;

        let summary = metrics.summary().await;
        assert_eq!(summary.total_requests + summary.blocked_requests, 0);
        assert!(summary.top_recipients.is_empty());
        assert_eq!(metrics.performance_stats().await, PerformanceStats::default());
        assert_eq!(metrics.requests_per_minute().await, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_per_minute_is_trailing() {
        let metrics = MetricsAggregator::new();
        for _ in 0..30 {
            metrics.record_request(request("1.1.1.1", "a", true, 1, 1)).await;
        }
        assert_eq!(metrics.requests_per_minute().await, 30.0);

        tokio::time::advance(Duration::from_secs(45)).await;
        for _ in 0..10 {
            metrics.record_request(request("1.1.1.1", "a", false, 0, 1)).await;
        }
        assert_eq!(metrics.requests_per_minute().await, 40.0);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(metrics.requests_per_minute().await, 10.0);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(metrics.requests_per_minute().await, 0.0);
        assert_eq!(metrics.total_requests().await, 40);
    }

    #[tokio::test]
    async fn test_records_mirror_into_telemetry() {
        let telemetry = Arc::new(Telemetry::new().unwrap());
        let metrics = MetricsAggregator::new().with_telemetry(Arc::clone(&telemetry));
        metrics.record_request(request("1.1.1.1", "a", true, 7, 1)).await;

        let text = telemetry.render().unwrap();
        assert!(text.contains("gatehouse_tokens_distributed_total 7"));
    }
}
