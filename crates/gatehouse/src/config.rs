//! Configuration management for Gatehouse.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional TOML file, `GATEHOUSE__*` environment variables and CLI flags.
//! Durations are expressed in whole seconds (`*_secs`) or milliseconds
//! (`*_ms`).

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use gatehouse_common::constants::{
    BLOCK_DURATION_SECS, CAPTCHA_SWEEP_INTERVAL_SECS, CAPTCHA_TTL_SECS, DEFAULT_BASELINE_LOAD,
    DEFAULT_LISTEN_ADDR, DEFAULT_POW_DIFFICULTY, DETECTOR_SWEEP_INTERVAL_SECS,
    MAX_ATTEMPTS_PER_DAY, MAX_ATTEMPTS_PER_HOUR, POW_CHALLENGE_TTL_SECS, POW_SWEEP_INTERVAL_SECS,
    STORE_TIMEOUT_MS, SUSPICIOUS_THRESHOLD,
};
use gatehouse_common::{CaptchaDifficulty, GuardError, serde_millis, serde_secs};
use serde::{Deserialize, Serialize};

use crate::pipeline::StoreFailurePolicy;

/// Hex digits in a SHA-256 digest; no difficulty above this is satisfiable
const MAX_POW_DIFFICULTY: u32 = 64;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Redis connection URL. In-memory counters are used when unset.
    #[serde(default)]
    pub redis_url: Option<String>,

    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Per-operation counter store timeout
    #[serde(default = "default_store_timeout", rename = "store_timeout_ms", with = "serde_millis")]
    pub store_timeout: Duration,

    /// What admission does when the counter store is unreachable
    #[serde(default)]
    pub store_failure_policy: StoreFailurePolicy,

    #[serde(default)]
    pub pow: PowConfig,

    #[serde(default)]
    pub captcha: CaptchaConfig,

    #[serde(default)]
    pub abuse: AbuseConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Proof-of-work configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowConfig {
    /// Whether admission demands a solved challenge
    #[serde(default = "default_true")]
    pub required: bool,

    /// Base difficulty (leading zero hex digits)
    #[serde(default = "default_pow_difficulty")]
    pub difficulty: u32,

    /// Retune difficulty from observed request load
    #[serde(default = "default_true")]
    pub adaptive: bool,

    /// Requests per minute considered normal load
    #[serde(default = "default_baseline_load")]
    pub baseline_load: f64,

    #[serde(default = "default_pow_ttl", rename = "challenge_ttl_secs", with = "serde_secs")]
    pub challenge_ttl: Duration,

    #[serde(default = "default_pow_sweep", rename = "sweep_interval_secs", with = "serde_secs")]
    pub sweep_interval: Duration,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            required: true,
            difficulty: default_pow_difficulty(),
            adaptive: true,
            baseline_load: default_baseline_load(),
            challenge_ttl: default_pow_ttl(),
            sweep_interval: default_pow_sweep(),
        }
    }
}

/// CAPTCHA configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// Whether admission demands a solved CAPTCHA
    #[serde(default = "default_true")]
    pub required: bool,

    #[serde(default = "default_captcha_length")]
    pub length: usize,

    #[serde(default = "default_captcha_width")]
    pub width: u32,

    #[serde(default = "default_captcha_height")]
    pub height: u32,

    #[serde(default = "default_captcha_ttl", rename = "ttl_secs", with = "serde_secs")]
    pub ttl: Duration,

    #[serde(default = "default_captcha_sweep", rename = "sweep_interval_secs", with = "serde_secs")]
    pub sweep_interval: Duration,

    #[serde(default)]
    pub difficulty: CaptchaDifficulty,

    /// TrueType font for glyphs; the built-in bitmap face is used otherwise
    #[serde(default)]
    pub font_path: Option<String>,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            required: true,
            length: default_captcha_length(),
            width: default_captcha_width(),
            height: default_captcha_height(),
            ttl: default_captcha_ttl(),
            sweep_interval: default_captcha_sweep(),
            difficulty: CaptchaDifficulty::default(),
            font_path: None,
        }
    }
}

/// Abuse detector configuration. Zero limits fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbuseConfig {
    #[serde(default = "default_max_per_hour")]
    pub max_attempts_per_hour: u32,

    #[serde(default = "default_max_per_day")]
    pub max_attempts_per_day: u32,

    #[serde(default = "default_block_duration", rename = "block_duration_secs", with = "serde_secs")]
    pub block_duration: Duration,

    #[serde(default = "default_true")]
    pub subnet_check_enabled: bool,

    #[serde(default = "default_true")]
    pub vpn_detection_enabled: bool,

    #[serde(default = "default_suspicious_threshold")]
    pub suspicious_threshold: u32,

    #[serde(default = "default_detector_sweep", rename = "sweep_interval_secs", with = "serde_secs")]
    pub sweep_interval: Duration,
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            max_attempts_per_hour: default_max_per_hour(),
            max_attempts_per_day: default_max_per_day(),
            block_duration: default_block_duration(),
            subnet_check_enabled: true,
            vpn_detection_enabled: true,
            suspicious_threshold: default_suspicious_threshold(),
            sweep_interval: default_detector_sweep(),
        }
    }
}

impl AbuseConfig {
    /// Replace zero values with defaults
    pub fn normalized(mut self) -> Self {
        if self.max_attempts_per_hour == 0 {
            self.max_attempts_per_hour = MAX_ATTEMPTS_PER_HOUR;
        }
        if self.max_attempts_per_day == 0 {
            self.max_attempts_per_day = MAX_ATTEMPTS_PER_DAY;
        }
        if self.block_duration.is_zero() {
            self.block_duration = default_block_duration();
        }
        if self.suspicious_threshold == 0 {
            self.suspicious_threshold = SUSPICIOUS_THRESHOLD;
        }
        if self.sweep_interval.is_zero() {
            self.sweep_interval = default_detector_sweep();
        }
        self
    }
}

/// Fixed-window quota configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions per IP per window
    #[serde(default = "default_per_ip")]
    pub per_ip: u32,

    /// Admissions per destination address per window
    #[serde(default = "default_per_address")]
    pub per_address: u32,

    #[serde(default = "default_window", rename = "window_secs", with = "serde_secs")]
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_ip: default_per_ip(),
            per_address: default_per_address(),
            window: default_window(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_store_timeout() -> Duration { Duration::from_millis(STORE_TIMEOUT_MS) }
fn default_pow_difficulty() -> u32 { DEFAULT_POW_DIFFICULTY }
fn default_baseline_load() -> f64 { DEFAULT_BASELINE_LOAD }
fn default_pow_ttl() -> Duration { Duration::from_secs(POW_CHALLENGE_TTL_SECS) }
fn default_pow_sweep() -> Duration { Duration::from_secs(POW_SWEEP_INTERVAL_SECS) }
fn default_captcha_length() -> usize { 6 }
fn default_captcha_width() -> u32 { 200 }
fn default_captcha_height() -> u32 { 80 }
fn default_captcha_ttl() -> Duration { Duration::from_secs(CAPTCHA_TTL_SECS) }
fn default_captcha_sweep() -> Duration { Duration::from_secs(CAPTCHA_SWEEP_INTERVAL_SECS) }
fn default_max_per_hour() -> u32 { MAX_ATTEMPTS_PER_HOUR }
fn default_max_per_day() -> u32 { MAX_ATTEMPTS_PER_DAY }
fn default_block_duration() -> Duration { Duration::from_secs(BLOCK_DURATION_SECS) }
fn default_suspicious_threshold() -> u32 { SUSPICIOUS_THRESHOLD }
fn default_detector_sweep() -> Duration { Duration::from_secs(DETECTOR_SWEEP_INTERVAL_SECS) }
fn default_per_ip() -> u32 { 10 }
fn default_per_address() -> u32 { 1 }
fn default_window() -> Duration { Duration::from_secs(24 * 3600) }

/// Values supplied on the command line
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub redis_url: Option<String>,
    pub listen: Option<String>,
}

impl AppConfig {
    /// Load configuration from file and environment, with CLI overrides
    pub fn load(config_path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        if !Path::new(config_path).exists() {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("GATEHOUSE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        let mut config: Self = settings
            .try_deserialize()
            .context("Failed to parse configuration")?;

        // Apply CLI overrides
        if let Some(ref redis_url) = overrides.redis_url {
            config.redis_url = Some(redis_url.clone());
        }
        if let Some(ref listen) = overrides.listen {
            config.listen_addr = listen.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no engine can honour
    pub fn validate(&self) -> Result<(), GuardError> {
        if self.pow.difficulty > MAX_POW_DIFFICULTY {
            return Err(GuardError::Config(format!(
                "pow.difficulty must be at most {MAX_POW_DIFFICULTY}"
            )));
        }
        if !(self.pow.baseline_load > 0.0) {
            return Err(GuardError::Config("pow.baseline_load must be positive".into()));
        }
        if self.rate_limit.per_ip == 0 || self.rate_limit.per_address == 0 {
            return Err(GuardError::Config("rate_limit quotas must be non-zero".into()));
        }
        if self.rate_limit.window.is_zero() {
            return Err(GuardError::Config("rate_limit.window_secs must be non-zero".into()));
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            listen_addr: default_listen_addr(),
            store_timeout: default_store_timeout(),
            store_failure_policy: StoreFailurePolicy::default(),
            pow: PowConfig::default(),
            captcha: CaptchaConfig::default(),
            abuse: AbuseConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.rate_limit.per_ip, 10);
        assert_eq!(config.rate_limit.per_address, 1);
        assert_eq!(config.rate_limit.window, Duration::from_secs(86_400));
        assert_eq!(config.abuse, AbuseConfig::default());
        assert_eq!(config.store_failure_policy, StoreFailurePolicy::FailClosed);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_durations_read_as_seconds() {
        let config: AppConfig = serde_json::from_str(
            r#"{"captcha": {"ttl_secs": 60, "difficulty": "hard"}, "rate_limit": {"window_secs": 3600}}"#,
        )
        .unwrap();
        assert_eq!(config.captcha.ttl, Duration::from_secs(60));
        assert_eq!(config.captcha.difficulty, CaptchaDifficulty::Hard);
        assert_eq!(config.rate_limit.window, Duration::from_secs(3600));
    }

    #[test]
    fn test_zero_abuse_limits_normalize() {
        let config = AbuseConfig {
            max_attempts_per_hour: 0,
            max_attempts_per_day: 0,
            block_duration: Duration::ZERO,
            suspicious_threshold: 0,
            ..AbuseConfig::default()
        }
        .normalized();
        assert_eq!(config, AbuseConfig::default());
    }

    #[test]
    fn test_validate_rejects_impossible_difficulty() {
        let mut config = AppConfig::default();
        config.pow.difficulty = 65;
        assert!(matches!(config.validate(), Err(GuardError::Config(_))));

        config.pow.difficulty = 4;
        config.rate_limit.per_ip = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults_and_overrides() {
        let overrides = ConfigOverrides {
            redis_url: Some("redis://127.0.0.1:6379".into()),
            listen: Some("0.0.0.0:9000".into()),
        };
        let config = AppConfig::load("/nonexistent/gatehouse", &overrides).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1:6379"));
    }
}
