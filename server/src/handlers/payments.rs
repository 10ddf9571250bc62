use axum::{extract::State, response::Response, Json};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::models::reservation::ReservationStatus;
use crate::services::AppState;
use crate::utils::error::AppError;
use crate::utils::response::{accepted, created, empty_success, success};

#[derive(Debug, Deserialize)]
pub struct ConfirmPaymentRequest {
    pub session_id: String,
    pub payment_ref: String,
    pub amount: Decimal,
}

/// Provider notification. Only `payment_ref` is trusted; the rest is advisory.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub payment_ref: String,
    #[serde(default)]
    pub merchant_ref: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Result<Response, AppError> {
    let completed = state
        .reservations
        .confirm_payment(&request.session_id, &request.payment_ref, request.amount)
        .await?;

    if completed.reservation.status == ReservationStatus::ConfirmedPending {
        Ok(accepted(completed, "Reservation held until the deposit arrives"))
    } else {
        Ok(created(completed, "Reservation confirmed"))
    }
}

pub async fn payment_webhook(
    State(state): State<AppState>,
    Json(payload): Json<WebhookPayload>,
) -> Result<Response, AppError> {
    tracing::info!(
        payment_ref = %payload.payment_ref,
        merchant_ref = ?payload.merchant_ref,
        status = ?payload.status,
        "Payment webhook received"
    );

    match state
        .reservations
        .handle_payment_webhook(&payload.payment_ref)
        .await
    {
        Ok(outcome) => Ok(success(outcome, "Webhook processed")),
        // Providers retry until they see a 2xx.
        Err(AppError::DuplicateWebhookEvent) => Ok(empty_success("Webhook already processed")),
        Err(e) => Err(e),
    }
}
