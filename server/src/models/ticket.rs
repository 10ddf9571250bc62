use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A sellable ticket type and its remaining inventory.
///
/// `0 <= remaining_quantity <= total_quantity` holds at all times; only the
/// inventory ledger mutates `remaining_quantity`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Ticket {
    pub id: Uuid,
    pub expo_id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub total_quantity: i32,
    pub remaining_quantity: i32,
    /// Overrides the expo start as the beginning of the QR display window.
    pub valid_from: Option<DateTime<Utc>>,
    /// Overrides the expo end as the end of the QR display window.
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    pub fn sold(&self) -> i32 {
        self.total_quantity - self.remaining_quantity
    }
}
