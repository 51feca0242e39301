//! HTTP route handlers for Gatehouse.

use std::time::Duration;

use axum::{
    Json, Router,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::{DateTime, Utc};
use gatehouse_common::GuardError;
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod admin;
mod admission;
mod challenge;
mod health;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/metrics", get(health::metrics))

        // Challenges
        .route("/pow/challenge", get(challenge::pow_challenge))
        .route("/captcha", get(challenge::captcha_challenge))

        // Admission decisions and outcome reports
        .route("/admission", post(admission::admit))
        .route("/admission/report", post(admission::report))

        // Admin endpoints (expose only on a trusted interface)
        .nest("/admin", admin_routes())

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn admin_routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(admin::stats))
        .route("/metrics/reset", post(admin::reset_metrics))
        .route("/block/ip", post(admin::block_ip))
        .route("/block/ip/{ip}", delete(admin::unblock_ip))
        .route("/block/address", post(admin::block_address))
        .route("/block/address/{address}", delete(admin::unblock_address))
}

/// JSON error response wrapping [`GuardError`]
#[derive(Debug)]
pub struct ApiError(pub GuardError);

impl From<GuardError> for ApiError {
    fn from(err: GuardError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_until: Option<DateTime<Utc>>,
}

fn error_code(err: &GuardError) -> &'static str {
    match err {
        GuardError::NotFound | GuardError::Expired | GuardError::PowRejected => "challenge_invalid",
        GuardError::Unsolvable { .. } => "unsolvable",
        GuardError::StoreUnavailable(_) => "store_unavailable",
        GuardError::Blocked { .. } => "blocked",
        GuardError::RateLimited { .. } => "rate_limited",
        GuardError::CaptchaFailed => "captcha_failed",
        GuardError::PowRequired => "pow_required",
        GuardError::InvalidInput(_) => "invalid_input",
        GuardError::Config(_) | GuardError::Internal(_) => "internal",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }

        let retry_after = match &err {
            GuardError::RateLimited { retry_after, .. } => retry_after.map(round_up_secs),
            _ => None,
        };
        let blocked_until = match &err {
            GuardError::Blocked { until, .. } => *until,
            _ => None,
        };

        let body = ErrorBody {
            error: error_code(&err),
            message: err.public_message(),
            retryable: err.is_retryable(),
            retry_after_secs: retry_after,
            blocked_until,
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

fn round_up_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}
