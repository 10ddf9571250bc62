use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "payment_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Virtual account issued, deposit not received yet.
    Pending,
    Paid,
    Refunded,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Refunded => "REFUNDED",
            PaymentStatus::Cancelled => "CANCELLED",
        }
    }
}

/// Audit record tying a verified payment to a reservation and its mileage delta.
///
/// Written once per verified payment; afterwards only `status` and
/// `refunded_amount` change.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ReservationPaymentInfo {
    pub reservation_id: Uuid,
    pub payment_ref: String,
    pub total_amount: Decimal,
    pub status: PaymentStatus,
    pub used_mileage: i64,
    pub saved_mileage: i64,
    pub refunded_amount: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
