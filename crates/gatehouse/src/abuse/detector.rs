//! Per-IP and per-address attempt tracking with temporary blocks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use gatehouse_common::DetectionResult;
use gatehouse_common::constants::TRACKER_RETENTION_SECS;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::network::{likely_proxy, same_subnet};
use crate::clock::{deadline, elapsed};
use crate::config::AbuseConfig;
use crate::tasks::spawn_periodic;

const HOUR: Duration = Duration::from_secs(3600);
const BURST_WINDOW: Duration = Duration::from_secs(60);
/// Tracked IPs in one subnet above which the subnet is denied
const SUBNET_IP_LIMIT: usize = 5;
/// Distinct addresses from one IP before each extra one adds risk
const FREE_ADDRESSES: usize = 3;
const PROXY_DELAY: Duration = Duration::from_secs(30);
/// Risk above which the score itself becomes the delay in seconds
const DELAY_RISK_THRESHOLD: u32 = 50;

pub const REASON_IP_BLOCKED: &str = "IP address is temporarily blocked";
pub const REASON_ADDRESS_BLOCKED: &str = "Address is temporarily blocked";
pub const REASON_HOURLY_LIMIT: &str = "Too many requests from this IP (hourly limit exceeded)";
pub const REASON_DAILY_LIMIT: &str = "Daily request limit exceeded";
pub const REASON_SUBNET: &str = "Multiple requests detected from your subnet";
pub const REASON_MANY_ADDRESSES: &str = "Suspicious: Multiple addresses requested from same IP";

/// Attempt history for one IP or one address
#[derive(Debug, Clone)]
pub struct AttemptTracker {
    /// Attempts inside the current hourly window
    pub count: u32,
    /// Anchor of the hourly window
    pub first_attempt: DateTime<Utc>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub successful: u32,
    pub failed: u32,
    /// Destination address -> attempts (IP trackers only)
    pub addresses: HashMap<String, u32>,
}

impl AttemptTracker {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            first_attempt: now,
            last_attempt: None,
            successful: 0,
            failed: 0,
            addresses: HashMap::new(),
        }
    }

    fn record(&mut self, success: bool, now: DateTime<Utc>) {
        self.count += 1;
        self.last_attempt = Some(now);
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }

    fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        elapsed(self.last_attempt.unwrap_or(self.first_attempt), now)
    }
}

#[derive(Default)]
struct DetectorState {
    ip_attempts: HashMap<String, AttemptTracker>,
    address_attempts: HashMap<String, AttemptTracker>,
    blocked_ips: HashMap<String, DateTime<Utc>>,
    blocked_addresses: HashMap<String, DateTime<Utc>>,
}

/// Detector counters for stats endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DetectorStats {
    pub tracked_ips: usize,
    pub tracked_addresses: usize,
    pub blocked_ips: usize,
    pub blocked_addresses: usize,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
}

/// Abuse detection service
pub struct AbuseDetector {
    state: RwLock<DetectorState>,
    config: AbuseConfig,
}

impl AbuseDetector {
    pub fn new(config: AbuseConfig) -> Self {
        Self {
            state: RwLock::new(DetectorState::default()),
            config: config.normalized(),
        }
    }

    /// Decide whether a request from `ip` for `address` may proceed
    pub async fn check_request(&self, ip: &str, address: &str) -> DetectionResult {
        self.check_request_at(ip, address, Utc::now()).await
    }

    pub(crate) async fn check_request_at(
        &self,
        ip: &str,
        address: &str,
        now: DateTime<Utc>,
    ) -> DetectionResult {
        let mut guard = self.state.write().await;
        let state = &mut *guard;

        if let Some(until) = active_block(&mut state.blocked_ips, ip, now) {
            return DetectionResult::denied(REASON_IP_BLOCKED, Some(until));
        }
        if let Some(until) = active_block(&mut state.blocked_addresses, address, now) {
            return DetectionResult::denied(REASON_ADDRESS_BLOCKED, Some(until));
        }

        let tracker = state
            .ip_attempts
            .entry(ip.to_string())
            .or_insert_with(|| AttemptTracker::new(now));

        let mut result = DetectionResult::allowed();
        result.risk_score = self.risk_score(tracker, now);

        if elapsed(tracker.first_attempt, now) < HOUR {
            if tracker.count >= self.config.max_attempts_per_hour {
                let until = deadline(now, self.config.block_duration);
                state.blocked_ips.insert(ip.to_string(), until);
                tracing::warn!(ip = %ip, count = tracker.count, "Hourly limit exceeded, IP blocked");
                return deny(result, REASON_HOURLY_LIMIT, until);
            }
        } else {
            tracker.count = 0;
            tracker.first_attempt = now;
        }

        if tracker.successful + tracker.failed >= self.config.max_attempts_per_day {
            let until = deadline(now, self.config.block_duration);
            state.blocked_ips.insert(ip.to_string(), until);
            tracing::warn!(ip = %ip, "Daily limit exceeded, IP blocked");
            return deny(result, REASON_DAILY_LIMIT, until);
        }

        let distinct_addresses = tracker.addresses.len();
        let parsed: Option<IpAddr> = ip.parse().ok();

        if self.config.subnet_check_enabled {
            if let Some(addr) = parsed {
                if subnet_population(&state.ip_attempts, addr) > SUBNET_IP_LIMIT {
                    result.risk_score += 30;
                    result.allowed = false;
                    result.reason = Some(REASON_SUBNET.to_string());
                    tracing::warn!(ip = %ip, "Subnet abuse detected");
                    return result;
                }
            }
        }

        if self.config.vpn_detection_enabled && parsed.is_some_and(likely_proxy) {
            result.risk_score += 20;
            result.recommended_delay = PROXY_DELAY;
        }

        if distinct_addresses > self.config.suspicious_threshold as usize {
            result.risk_score += 25;
            result.reason = Some(REASON_MANY_ADDRESSES.to_string());
        }

        if result.risk_score > DELAY_RISK_THRESHOLD {
            result.recommended_delay = Duration::from_secs(u64::from(result.risk_score));
        }

        if result.risk_score > 0 {
            tracing::debug!(ip = %ip, risk = result.risk_score, "Elevated request risk");
        }

        result
    }

    fn risk_score(&self, tracker: &AttemptTracker, now: DateTime<Utc>) -> u32 {
        let mut score = 0;

        if tracker.count > self.config.suspicious_threshold {
            score += 20;
        }
        if tracker.failed > tracker.successful.saturating_mul(2) {
            score += 15;
        }
        if tracker.addresses.len() > FREE_ADDRESSES {
            score += 10 * (tracker.addresses.len() - FREE_ADDRESSES) as u32;
        }
        let recent = tracker
            .last_attempt
            .is_some_and(|last| elapsed(last, now) < BURST_WINDOW);
        if recent && tracker.count > 3 {
            score += 25;
        }

        score
    }

    /// Record the outcome of an admitted request
    pub async fn record_attempt(&self, ip: &str, address: &str, success: bool) {
        self.record_attempt_at(ip, address, success, Utc::now()).await
    }

    pub(crate) async fn record_attempt_at(
        &self,
        ip: &str,
        address: &str,
        success: bool,
        now: DateTime<Utc>,
    ) {
        let mut state = self.state.write().await;

        let ip_tracker = state
            .ip_attempts
            .entry(ip.to_string())
            .or_insert_with(|| AttemptTracker::new(now));
        ip_tracker.record(success, now);
        *ip_tracker.addresses.entry(address.to_string()).or_insert(0) += 1;

        state
            .address_attempts
            .entry(address.to_string())
            .or_insert_with(|| AttemptTracker::new(now))
            .record(success, now);
    }

    /// Block an IP, for the configured duration when `duration` is `None`.
    /// Returns the block expiry.
    pub async fn block_ip(&self, ip: &str, duration: Option<Duration>) -> DateTime<Utc> {
        let until = deadline(Utc::now(), duration.unwrap_or(self.config.block_duration));
        self.state
            .write()
            .await
            .blocked_ips
            .insert(ip.to_string(), until);
        tracing::warn!(ip = %ip, until = %until, "IP blocked");
        until
    }

    pub async fn block_address(&self, address: &str, duration: Option<Duration>) -> DateTime<Utc> {
        let until = deadline(Utc::now(), duration.unwrap_or(self.config.block_duration));
        self.state
            .write()
            .await
            .blocked_addresses
            .insert(address.to_string(), until);
        tracing::warn!(address = %address, until = %until, "Address blocked");
        until
    }

    /// Returns whether a block was lifted
    pub async fn unblock_ip(&self, ip: &str) -> bool {
        let removed = self.state.write().await.blocked_ips.remove(ip).is_some();
        if removed {
            tracing::info!(ip = %ip, "IP unblocked");
        }
        removed
    }

    pub async fn unblock_address(&self, address: &str) -> bool {
        let removed = self
            .state
            .write()
            .await
            .blocked_addresses
            .remove(address)
            .is_some();
        if removed {
            tracing::info!(address = %address, "Address unblocked");
        }
        removed
    }

    /// Evict idle trackers and lapsed blocks
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Utc::now()).await
    }

    pub(crate) async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let retention = Duration::from_secs(TRACKER_RETENTION_SECS);
        let mut state = self.state.write().await;
        let before = state.ip_attempts.len()
            + state.address_attempts.len()
            + state.blocked_ips.len()
            + state.blocked_addresses.len();

        state.ip_attempts.retain(|_, t| t.idle_for(now) <= retention);
        state.address_attempts.retain(|_, t| t.idle_for(now) <= retention);
        state.blocked_ips.retain(|_, until| *until >= now);
        state.blocked_addresses.retain(|_, until| *until >= now);

        let after = state.ip_attempts.len()
            + state.address_attempts.len()
            + state.blocked_ips.len()
            + state.blocked_addresses.len();
        let removed = before - after;
        if removed > 0 {
            tracing::debug!(removed, "Swept abuse detector state");
        }
        removed
    }

    pub fn spawn_sweeper(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        spawn_periodic(
            "abuse-sweep",
            self.config.sweep_interval,
            token,
            move || {
                let detector = Arc::clone(&detector);
                async move {
                    detector.sweep().await;
                }
            },
        )
    }

    pub async fn stats(&self) -> DetectorStats {
        let state = self.state.read().await;
        let mut stats = DetectorStats {
            tracked_ips: state.ip_attempts.len(),
            tracked_addresses: state.address_attempts.len(),
            blocked_ips: state.blocked_ips.len(),
            blocked_addresses: state.blocked_addresses.len(),
            ..Default::default()
        };
        for tracker in state.ip_attempts.values() {
            stats.total_attempts += u64::from(tracker.count);
            stats.successful_attempts += u64::from(tracker.successful);
            stats.failed_attempts += u64::from(tracker.failed);
        }
        stats
    }
}

/// Expiry of a live block on `key`. Stale entries are removed.
fn active_block(
    blocks: &mut HashMap<String, DateTime<Utc>>,
    key: &str,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let until = *blocks.get(key)?;
    if now < until {
        Some(until)
    } else {
        blocks.remove(key);
        None
    }
}

fn subnet_population(trackers: &HashMap<String, AttemptTracker>, ip: IpAddr) -> usize {
    trackers
        .keys()
        .filter_map(|key| key.parse::<IpAddr>().ok())
        .filter(|tracked| same_subnet(ip, *tracked))
        .count()
}

fn deny(mut result: DetectionResult, reason: &str, until: DateTime<Utc>) -> DetectionResult {
    result.allowed = false;
    result.reason = Some(reason.to_string());
    result.blocked_until = Some(until);
    result
}
