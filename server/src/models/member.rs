use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered user. Guests book without a member row and never touch mileage.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub mileage: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
