//! Operator endpoints: statistics and manual blocks.

use std::time::Duration;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use gatehouse_common::{PerformanceStats, Summary};
use serde::{Deserialize, Serialize};

use crate::abuse::DetectorStats;
use crate::captcha::CaptchaStats;
use crate::pow::PowStats;
use crate::state::AppState;

#[derive(Serialize)]
pub struct StatsResponse {
    summary: Summary,
    performance: PerformanceStats,
    detector: DetectorStats,
    pow: PowStats,
    captcha: CaptchaStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    load: Option<f64>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let load = match &state.adaptive {
        Some(adaptive) => Some(adaptive.current_load().await),
        None => None,
    };

    Json(StatsResponse {
        summary: state.metrics.summary().await,
        performance: state.metrics.performance_stats().await,
        detector: state.detector.stats().await,
        pow: state.pow.stats().await,
        captcha: state.captcha.stats().await,
        load,
    })
}

pub async fn reset_metrics(State(state): State<AppState>) -> StatusCode {
    state.metrics.reset().await;
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
pub struct BlockIp {
    ip: String,
    /// Defaults to the configured block duration
    duration_secs: Option<u64>,
}

#[derive(Deserialize)]
pub struct BlockAddress {
    address: String,
    duration_secs: Option<u64>,
}

#[derive(Serialize)]
pub struct BlockResponse {
    blocked: String,
    until: DateTime<Utc>,
}

pub async fn block_ip(
    State(state): State<AppState>,
    Json(payload): Json<BlockIp>,
) -> Json<BlockResponse> {
    let until = state
        .detector
        .block_ip(&payload.ip, payload.duration_secs.map(Duration::from_secs))
        .await;
    Json(BlockResponse {
        blocked: payload.ip,
        until,
    })
}

pub async fn block_address(
    State(state): State<AppState>,
    Json(payload): Json<BlockAddress>,
) -> Json<BlockResponse> {
    let until = state
        .detector
        .block_address(&payload.address, payload.duration_secs.map(Duration::from_secs))
        .await;
    Json(BlockResponse {
        blocked: payload.address,
        until,
    })
}

pub async fn unblock_ip(State(state): State<AppState>, Path(ip): Path<String>) -> StatusCode {
    if state.detector.unblock_ip(&ip).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn unblock_address(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> StatusCode {
    if state.detector.unblock_address(&address).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}
