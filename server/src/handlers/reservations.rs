use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::models::reservation::Actor;
use crate::services::reservation::StartReservationRequest;
use crate::services::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{created, success};

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn start_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Json(request): Json<StartReservationRequest>,
) -> Result<Response, AppError> {
    let started = state.reservations.start_reservation(&actor, request).await?;
    Ok(created(started, "Reservation staged, awaiting payment"))
}

pub async fn refund_quote(
    State(state): State<AppState>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
) -> Result<Response, AppError> {
    let quote = state
        .refunds
        .calculate_refund(reservation_id, &actor)
        .await?;
    Ok(success(quote, "Refund calculated"))
}

pub async fn cancel_reservation(
    State(state): State<AppState>,
    actor: Actor,
    Path(reservation_id): Path<Uuid>,
    body: Option<Json<CancelRequest>>,
) -> Result<Response, AppError> {
    let request = body.map(|Json(request)| request).unwrap_or_default();
    let reason = request
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or("cancelled by customer");

    let cancellation = state
        .refunds
        .cancel_reservation(reservation_id, &actor, reason)
        .await?;
    Ok(success(cancellation, "Reservation cancelled"))
}
