//! Common error types for Gatehouse components.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::LimitScope;

/// Errors surfaced by the admission engines.
///
/// Elevated risk is never an error: an allowed request carrying a
/// recommended delay is reported through [`crate::DetectionResult`].
#[derive(Debug, Error)]
pub enum GuardError {
    /// Challenge or CAPTCHA id unknown, swept, or already consumed
    #[error("Challenge not found")]
    NotFound,

    /// Challenge was present but past its expiry (it has been evicted)
    #[error("Challenge expired")]
    Expired,

    /// Reference solver exhausted its attempt budget
    #[error("No solution found after {attempts} attempts")]
    Unsolvable { attempts: u64 },

    /// External counter store unreachable or timed out
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Hard denial with a concrete unblock time when known
    #[error("Blocked: {reason}")]
    Blocked {
        reason: String,
        until: Option<DateTime<Utc>>,
    },

    /// Per-window quota reached
    #[error("Rate limit exceeded for {scope}")]
    RateLimited {
        scope: LimitScope,
        retry_after: Option<Duration>,
    },

    /// CAPTCHA answer missing, wrong, expired, or unknown
    #[error("Captcha verification failed")]
    CaptchaFailed,

    /// Proof-of-work is required but no solution was supplied
    #[error("Proof-of-work solution required")]
    PowRequired,

    /// Proof-of-work solution did not meet the challenge difficulty
    #[error("Proof-of-work solution rejected")]
    PowRejected,

    /// Invalid input/request
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GuardError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound | Self::Expired | Self::PowRejected => 400,
            Self::Unsolvable { .. } => 500,
            Self::StoreUnavailable(_) => 503,
            Self::Blocked { .. } => 403,
            Self::RateLimited { .. } => 429,
            Self::CaptchaFailed => 400,
            Self::PowRequired => 428,
            Self::InvalidInput(_) => 400,
            Self::Config(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::RateLimited { .. })
    }

    /// Message safe to hand to an external caller.
    ///
    /// Every invalid-challenge case shares one message so callers cannot
    /// learn which ids exist.
    pub fn public_message(&self) -> String {
        match self {
            Self::NotFound | Self::Expired | Self::PowRejected => {
                "Challenge expired or invalid".to_string()
            }
            Self::StoreUnavailable(_) | Self::Config(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
            Self::Blocked { reason, .. } => reason.clone(),
            Self::RateLimited {
                scope: LimitScope::Ip,
                ..
            } => "Too many requests from your IP address. Please try again later.".to_string(),
            Self::RateLimited {
                scope: LimitScope::Address,
                ..
            } => "This address has already received tokens recently.".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_and_expired_share_public_message() {
        assert_eq!(
            GuardError::NotFound.public_message(),
            GuardError::Expired.public_message()
        );
        assert_eq!(GuardError::NotFound.status_code(), GuardError::Expired.status_code());
    }

    #[test]
    fn test_rejected_solution_looks_like_unknown_challenge() {
        let rejected = GuardError::PowRejected;
        assert_eq!(rejected.public_message(), GuardError::NotFound.public_message());
        assert_eq!(rejected.status_code(), GuardError::NotFound.status_code());
        assert_ne!(GuardError::PowRequired.status_code(), rejected.status_code());
    }

    #[test]
    fn test_store_errors_do_not_leak_details() {
        let err = GuardError::StoreUnavailable("connection refused 10.0.0.7:6379".into());
        assert_eq!(err.status_code(), 503);
        assert!(err.is_retryable());
        assert!(!err.public_message().contains("10.0.0.7"));
    }
}
