use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::reservation::{ReserverDetails, UserType};

/// Reservation intent staged in the cache between "start" and payment.
///
/// Lives only in the pre-reservation cache under `session_id`; consumed once
/// by a successful completion or dropped by TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreReservationIntent {
    pub session_id: String,
    pub expo_id: Uuid,
    pub ticket_id: Uuid,
    pub user_type: UserType,
    pub user_id: Uuid,
    pub quantity: i32,
    pub mileage_used: i64,
    /// `price * quantity - mileage_used`, fixed when the intent was created.
    pub payable_amount: Decimal,
    pub reservers: Vec<ReserverDetails>,
    pub created_at: DateTime<Utc>,
}
