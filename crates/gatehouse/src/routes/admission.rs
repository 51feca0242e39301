//! Admission decision and outcome reporting endpoints.

use axum::{Json, extract::State, http::StatusCode};
use gatehouse_common::{Admission, AdmissionRequest, Outcome};
use serde::Deserialize;

use super::ApiError;
use crate::state::AppState;

/// Run the full admission pipeline for one request
pub async fn admit(
    State(state): State<AppState>,
    Json(request): Json<AdmissionRequest>,
) -> Result<Json<Admission>, ApiError> {
    let admission = state.pipeline.admit(&request).await?;
    Ok(Json(admission))
}

#[derive(Deserialize)]
pub struct ReportRequest {
    #[serde(flatten)]
    request: AdmissionRequest,
    outcome: Outcome,
}

/// Record the outcome of an admitted request
pub async fn report(
    State(state): State<AppState>,
    Json(payload): Json<ReportRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .pipeline
        .report(&payload.request, &payload.outcome)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
