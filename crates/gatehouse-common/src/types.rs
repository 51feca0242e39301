//! Core types shared across Gatehouse components.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialize a `Duration` as whole seconds.
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Serialize a `Duration` as whole milliseconds.
pub mod serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Which quota a rate-limit decision refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitScope {
    Ip,
    Address,
}

impl fmt::Display for LimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip => f.write_str("ip"),
            Self::Address => f.write_str("address"),
        }
    }
}

/// CAPTCHA difficulty tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaDifficulty {
    /// Upper-case letters and digits without look-alikes (0/O, 1/I)
    Easy,
    /// Same alphabet as easy
    #[default]
    Medium,
    /// Full mixed-case alphabet plus wave distortion
    Hard,
}

impl CaptchaDifficulty {
    const UNAMBIGUOUS: &'static str = "ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    const FULL: &'static str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    /// Characters a solution is drawn from
    pub fn alphabet(&self) -> &'static [u8] {
        match self {
            Self::Easy | Self::Medium => Self::UNAMBIGUOUS.as_bytes(),
            Self::Hard => Self::FULL.as_bytes(),
        }
    }

    /// Only the mixed-case tier compares case-sensitively
    pub fn case_sensitive(&self) -> bool {
        matches!(self, Self::Hard)
    }

    /// Whether the rendered image receives wave distortion
    pub fn distorted(&self) -> bool {
        matches!(self, Self::Hard)
    }
}

/// A proof-of-work puzzle handed to the client.
///
/// The client must find any string `s` such that
/// `hex(sha256(nonce || s))` starts with `difficulty` zeros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowChallenge {
    pub challenge_id: String,
    pub nonce: String,
    pub difficulty: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PowChallenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// A rendered CAPTCHA together with its answer.
///
/// The solution and raw image never serialize; clients receive the image as
/// a data URI through the route layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaChallenge {
    pub challenge_id: String,

    #[serde(skip_serializing)]
    pub solution: String,

    /// PNG-encoded image bytes
    #[serde(skip)]
    pub image_png: Vec<u8>,

    pub difficulty: CaptchaDifficulty,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CaptchaChallenge {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Outcome of an abuse check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub allowed: bool,

    /// Present when denied, or when allowed with elevated risk
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub risk_score: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<DateTime<Utc>>,

    /// Advisory friction; never a denial on its own
    #[serde(rename = "recommended_delay_secs", with = "serde_secs")]
    pub recommended_delay: Duration,
}

impl DetectionResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
            risk_score: 0,
            blocked_until: None,
            recommended_delay: Duration::ZERO,
        }
    }

    pub fn denied(reason: impl Into<String>, blocked_until: Option<DateTime<Utc>>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            risk_score: 0,
            blocked_until,
            recommended_delay: Duration::ZERO,
        }
    }
}

/// Everything the HTTP layer hands to the admission pipeline for one request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Client IP, already resolved by the upstream proxy
    pub ip: String,
    /// Destination address, format-checked by the caller
    pub address: String,
    #[serde(default)]
    pub captcha_id: Option<String>,
    #[serde(default)]
    pub captcha_answer: Option<String>,
    #[serde(default)]
    pub pow_challenge_id: Option<String>,
    #[serde(default)]
    pub pow_solution: Option<String>,
}

/// A positive admission decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Admission {
    pub risk_score: u32,
    #[serde(rename = "recommended_delay_secs", with = "serde_secs")]
    pub recommended_delay: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

/// What happened after an admitted request performed its external action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    #[serde(default)]
    pub amount: u64,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(rename = "response_time_ms", with = "serde_millis", default)]
    pub response_time: Duration,
}

/// Metrics for a single completed request
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub ip: String,
    pub address: String,
    pub amount: u64,
    pub success: bool,
    pub error_type: Option<String>,
    pub response_time: Duration,
    pub timestamp: DateTime<Utc>,
    pub captcha_solved: bool,
    pub pow_completed: bool,
}

/// Request count for one recipient address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientStat {
    pub address: String,
    pub request_count: u64,
    pub total_amount: u64,
}

/// Aggregated operational summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub blocked_requests: u64,
    /// Percentage of total requests that succeeded (0-100)
    pub success_rate: f64,
    pub total_tokens_distributed: u64,
    pub avg_tokens_per_request: f64,
    pub unique_addresses: usize,
    pub unique_ips: usize,
    #[serde(rename = "avg_response_time_ms", with = "serde_millis")]
    pub avg_response_time: Duration,
    #[serde(rename = "max_response_time_ms", with = "serde_millis")]
    pub max_response_time: Duration,
    pub uptime_hours: f64,
    pub requests_per_hour: f64,
    pub top_recipients: Vec<RecipientStat>,
    pub error_breakdown: HashMap<String, u64>,
    /// Hour of day (0-23) -> request count
    pub hourly_distribution: BTreeMap<u32, u64>,
}

/// Response-time percentiles over the retained sample buffer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    #[serde(rename = "avg_response_time_ms", with = "serde_millis")]
    pub avg: Duration,
    #[serde(rename = "max_response_time_ms", with = "serde_millis")]
    pub max: Duration,
    #[serde(rename = "p50_response_time_ms", with = "serde_millis")]
    pub p50: Duration,
    #[serde(rename = "p95_response_time_ms", with = "serde_millis")]
    pub p95: Duration,
    #[serde(rename = "p99_response_time_ms", with = "serde_millis")]
    pub p99: Duration,
    pub total_samples: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_easy_alphabet_excludes_lookalikes() {
        let alphabet = CaptchaDifficulty::Easy.alphabet();
        for c in [b'0', b'O', b'1', b'I'] {
            assert!(!alphabet.contains(&c));
        }
        assert!(!CaptchaDifficulty::Medium.case_sensitive());
        assert!(CaptchaDifficulty::Hard.alphabet().contains(&b'z'));
    }

    #[test]
    fn test_detection_result_serializes_delay_in_seconds() {
        let mut result = DetectionResult::allowed();
        result.recommended_delay = Duration::from_secs(30);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["recommended_delay_secs"], 30);
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_captcha_solution_is_not_serialized() {
        let now = Utc::now();
        let challenge = CaptchaChallenge {
            challenge_id: "abc".into(),
            solution: "SECRET".into(),
            image_png: vec![1, 2, 3],
            difficulty: CaptchaDifficulty::Easy,
            created_at: now,
            expires_at: now,
        };
        let json = serde_json::to_string(&challenge).unwrap();
        assert!(!json.contains("SECRET"));
    }
}
