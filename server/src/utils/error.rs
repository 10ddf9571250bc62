use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

use crate::models::qr_code::QrStatus;
use crate::utils::response::error as error_response;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Pre-reservation session expired or unknown")]
    SessionExpired,

    #[error("Payment provider unreachable: {0}")]
    ProviderUnreachable(String),

    #[error("Payment amount mismatch: expected {expected}, provider reported {actual}")]
    PaymentMismatch { expected: Decimal, actual: Decimal },

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    #[error("Payment {0} has already been recorded")]
    DuplicatePayment(String),

    #[error("Insufficient inventory: requested {requested}, remaining {remaining}")]
    InsufficientInventory { requested: i32, remaining: i32 },

    #[error("Restoring {quantity} on ticket {ticket_id} would exceed its capacity")]
    InventoryOverflow { ticket_id: Uuid, quantity: i32 },

    #[error("Insufficient mileage: required {required}, balance {balance}")]
    InsufficientMileage { required: i64, balance: i64 },

    #[error("QR code {reason}")]
    QrInvalidTransition {
        status: QrStatus,
        reason: &'static str,
    },

    #[error("Could not generate a unique token after {0} attempts")]
    TokenExhausted(u32),

    #[error("Webhook event already processed")]
    DuplicateWebhookEvent,

    #[error("Reservation state conflict: {0}")]
    ReservationStateConflict(String),

    #[error("Database error")]
    DatabaseError(#[from] sqlx::Error),

    #[error("Cache error")]
    CacheError(#[from] redis::RedisError),

    #[error("External service error: {0}")]
    ExternalServiceError(String),

    #[error("Internal server error")]
    InternalServerError(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::SessionExpired => StatusCode::GONE,
            AppError::ProviderUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PaymentMismatch { .. } | AppError::PaymentFailed(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            AppError::DuplicatePayment(_)
            | AppError::InsufficientInventory { .. }
            | AppError::InsufficientMileage { .. }
            | AppError::QrInvalidTransition { .. }
            | AppError::ReservationStateConflict(_) => StatusCode::CONFLICT,
            AppError::DuplicateWebhookEvent => StatusCode::OK,
            AppError::ExternalServiceError(_) => StatusCode::BAD_GATEWAY,
            AppError::InventoryOverflow { .. }
            | AppError::TokenExhausted(_)
            | AppError::DatabaseError(_)
            | AppError::CacheError(_)
            | AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "VALIDATION_ERROR",
            AppError::AuthError(_) => "AUTH_ERROR",
            AppError::Forbidden(_) => "FORBIDDEN",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::SessionExpired => "SESSION_EXPIRED",
            AppError::ProviderUnreachable(_) => "PROVIDER_UNREACHABLE",
            AppError::PaymentMismatch { .. } => "PAYMENT_MISMATCH",
            AppError::PaymentFailed(_) => "PAYMENT_FAILED",
            AppError::DuplicatePayment(_) => "DUPLICATE_PAYMENT",
            AppError::InsufficientInventory { .. } => "SOLD_OUT",
            AppError::InventoryOverflow { .. } => "INVENTORY_OVERFLOW",
            AppError::InsufficientMileage { .. } => "INSUFFICIENT_MILEAGE",
            AppError::QrInvalidTransition { .. } => "QR_INVALID_TRANSITION",
            AppError::TokenExhausted(_) => "TOKEN_EXHAUSTED",
            AppError::DuplicateWebhookEvent => "DUPLICATE_WEBHOOK_EVENT",
            AppError::ReservationStateConflict(_) => "RESERVATION_STATE_CONFLICT",
            AppError::DatabaseError(_) => "DATABASE_ERROR",
            AppError::CacheError(_) => "CACHE_ERROR",
            AppError::ExternalServiceError(_) => "EXTERNAL_SERVICE_ERROR",
            AppError::InternalServerError(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            AppError::ProviderUnreachable(_) | AppError::DatabaseError(_) | AppError::CacheError(_)
        )
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            AppError::InsufficientInventory {
                requested,
                remaining,
            } => Some(json!({ "requested": requested, "remaining": remaining })),
            AppError::InsufficientMileage { required, balance } => {
                Some(json!({ "required": required, "balance": balance }))
            }
            AppError::QrInvalidTransition { status, .. } => Some(json!({ "status": status })),
            AppError::ProviderUnreachable(_) => Some(json!({ "retryable": true })),
            _ => None,
        }
    }

    fn log(&self) {
        match self {
            AppError::DatabaseError(e) => {
                error!(error = ?e, "Database error");
            }
            AppError::CacheError(e) => {
                error!(error = ?e, "Cache error");
            }
            AppError::InventoryOverflow { .. }
            | AppError::TokenExhausted(_)
            | AppError::ExternalServiceError(_)
            | AppError::InternalServerError(_) => {
                error!(error = ?self, "Application error");
            }
            AppError::ProviderUnreachable(msg) => {
                warn!(message = %msg, "Payment provider unreachable");
            }
            AppError::DuplicateWebhookEvent => {}
            _ => {
                warn!(code = self.code(), message = %self, "Request rejected");
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();

        self.log();

        // Only expose high-level message to the client
        let public_message = match &self {
            AppError::DatabaseError(_) => "A database error occurred".to_string(),
            AppError::CacheError(_) => "A cache error occurred".to_string(),
            AppError::InternalServerError(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        error_response(code, public_message, self.details(), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_conflict() {
        let sold_out = AppError::InsufficientInventory {
            requested: 2,
            remaining: 1,
        };
        assert_eq!(sold_out.status_code(), StatusCode::CONFLICT);
        assert_eq!(sold_out.code(), "SOLD_OUT");

        let used = AppError::QrInvalidTransition {
            status: QrStatus::Used,
            reason: "already used",
        };
        assert_eq!(used.status_code(), StatusCode::CONFLICT);
        assert_eq!(used.to_string(), "QR code already used");
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(AppError::ProviderUnreachable("timeout".into()).retryable());
        assert!(!AppError::PaymentFailed("declined".into()).retryable());
        assert!(!AppError::SessionExpired.retryable());
    }

    #[test]
    fn test_internal_details_are_hidden() {
        let response = AppError::InternalServerError("pool exhausted".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
