//! Shared constants for Gatehouse components.

/// Default Gatehouse HTTP listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8888";

/// Default proof-of-work difficulty (leading zero hex digits)
pub const DEFAULT_POW_DIFFICULTY: u32 = 4;

/// Proof-of-work challenge validity (10 minutes)
pub const POW_CHALLENGE_TTL_SECS: u64 = 600;

/// Interval between sweeps of expired PoW challenges (5 minutes)
pub const POW_SWEEP_INTERVAL_SECS: u64 = 300;

/// Attempt ceiling for the reference solver
pub const POW_MAX_SOLVE_ATTEMPTS: u64 = 10_000_000;

/// Load value the adaptive controller treats as normal
pub const DEFAULT_BASELINE_LOAD: f64 = 50.0;

/// CAPTCHA challenge expiry (5 minutes)
pub const CAPTCHA_TTL_SECS: u64 = 300;

/// Interval between sweeps of abandoned CAPTCHAs (5 minutes)
pub const CAPTCHA_SWEEP_INTERVAL_SECS: u64 = 300;

/// Default hourly attempt cap per IP
pub const MAX_ATTEMPTS_PER_HOUR: u32 = 10;

/// Default daily attempt cap per IP
pub const MAX_ATTEMPTS_PER_DAY: u32 = 50;

/// Default block duration (24 hours)
pub const BLOCK_DURATION_SECS: u64 = 86_400;

/// Default suspicious-activity threshold
pub const SUSPICIOUS_THRESHOLD: u32 = 5;

/// Interval between abuse-detector sweeps (1 hour)
pub const DETECTOR_SWEEP_INTERVAL_SECS: u64 = 3600;

/// Idle time after which attempt trackers are evicted (24 hours)
pub const TRACKER_RETENTION_SECS: u64 = 86_400;

/// Counter store operation timeout
pub const STORE_TIMEOUT_MS: u64 = 500;

/// Response-time samples kept before trimming
pub const MAX_RESPONSE_SAMPLES: usize = 10_000;

/// Samples retained after a trim
pub const RETAINED_RESPONSE_SAMPLES: usize = 1_000;

/// Store key prefixes
pub mod store_keys {
    /// Per-IP rate limit counter: ratelimit:ip:{ip}
    pub const RATELIMIT_IP_PREFIX: &str = "ratelimit:ip:";

    /// Per-address rate limit counter: ratelimit:address:{address}
    pub const RATELIMIT_ADDRESS_PREFIX: &str = "ratelimit:address:";

    /// PoW challenge ids: pow_{nanos}_{suffix}
    pub const POW_CHALLENGE_PREFIX: &str = "pow_";
}
