//! Challenge issuance endpoints.

use axum::{Json, extract::State};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ApiError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct PowChallengeResponse {
    challenge_id: String,
    nonce: String,
    difficulty: u32,
    expires_at: DateTime<Utc>,
}

/// Issue a proof-of-work puzzle
pub async fn pow_challenge(State(state): State<AppState>) -> Json<PowChallengeResponse> {
    let challenge = state.pow.issue_challenge().await;
    Json(PowChallengeResponse {
        challenge_id: challenge.challenge_id,
        nonce: challenge.nonce,
        difficulty: challenge.difficulty,
        expires_at: challenge.expires_at,
    })
}

#[derive(Serialize)]
pub struct CaptchaResponse {
    challenge_id: String,
    /// PNG as a data URI
    image: String,
    expires_at: DateTime<Utc>,
}

/// Generate a CAPTCHA image challenge
pub async fn captcha_challenge(
    State(state): State<AppState>,
) -> Result<Json<CaptchaResponse>, ApiError> {
    let challenge = state.captcha.generate().await?;
    Ok(Json(CaptchaResponse {
        image: format!("data:image/png;base64,{}", STANDARD.encode(&challenge.image_png)),
        challenge_id: challenge.challenge_id,
        expires_at: challenge.expires_at,
    }))
}
