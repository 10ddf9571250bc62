use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::reservation::Actor;
use crate::services::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Deserialize)]
pub struct CheckInRequest {
    pub token: String,
}

pub async fn verify_qr(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, AppError> {
    let verification = state.qr.verify(&token).await?;
    Ok(success(verification, "QR code verified"))
}

pub async fn check_in(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<CheckInRequest>,
) -> Result<Response, AppError> {
    let qr = state.qr.mark_used(&request.token, actor.id).await?;
    Ok(success(qr, "Checked in"))
}

pub async fn reissue_qr(
    State(state): State<AppState>,
    actor: Actor,
    Path(qr_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let qr = state.qr.reissue(qr_id, &actor).await?;
    Ok(created(qr, "QR code reissued"))
}
