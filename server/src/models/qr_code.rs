use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "qr_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QrStatus {
    /// Issued, display window not reached yet.
    Approved,
    Active,
    Used,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QrAction {
    Activate,
    Use,
    Expire,
}

impl QrStatus {
    /// Transition table for QR codes. USED and EXPIRED are terminal.
    pub fn transition(self, action: QrAction) -> Result<QrStatus, &'static str> {
        use QrAction::*;
        use QrStatus::*;

        match (self, action) {
            (Approved, Activate) => Ok(Active),
            (Active, Use) => Ok(Used),
            (Approved, Expire) | (Active, Expire) => Ok(Expired),
            (Approved, Use) => Err("not yet activated"),
            (Active, Activate) => Err("already active"),
            (Used, _) => Err("already used"),
            (Expired, _) => Err("expired"),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, QrStatus::Approved | QrStatus::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QrStatus::Approved => "APPROVED",
            QrStatus::Active => "ACTIVE",
            QrStatus::Used => "USED",
            QrStatus::Expired => "EXPIRED",
        }
    }

    /// Status a code should have at `now` given only its window.
    pub fn for_window(
        activated_at: DateTime<Utc>,
        expired_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QrStatus {
        if activated_at <= now && now < expired_at {
            QrStatus::Active
        } else {
            QrStatus::Approved
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QrCode {
    pub id: Uuid,
    pub reserver_id: Uuid,
    #[serde(skip_serializing)]
    pub token: String,
    pub image_url: Option<String>,
    pub status: QrStatus,
    pub activated_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QrCode {
    /// Stored status reclassified by time: a live code past its window is
    /// EXPIRED and an APPROVED code inside its window is ACTIVE.
    pub fn effective_status(&self, now: DateTime<Utc>) -> QrStatus {
        match self.status {
            QrStatus::Approved | QrStatus::Active if now >= self.expired_at => QrStatus::Expired,
            QrStatus::Approved if now >= self.activated_at => QrStatus::Active,
            status => status,
        }
    }

    /// Persist whatever the clock implies, returning true when the row changed.
    pub fn reconcile(&mut self, now: DateTime<Utc>) -> bool {
        let effective = self.effective_status(now);
        if effective == self.status {
            return false;
        }
        self.status = effective;
        self.updated_at = now;
        true
    }

    /// Apply `action` through the transition table, stamping `used_at` on use.
    pub fn apply(&mut self, action: QrAction, now: DateTime<Utc>) -> Result<(), &'static str> {
        let next = self.status.transition(action)?;
        self.status = next;
        self.updated_at = now;
        if next == QrStatus::Used {
            self.used_at = Some(now);
        }
        Ok(())
    }
}
