use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "user_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserType {
    Member,
    Guest,
}

impl UserType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserType::Member => "MEMBER",
            UserType::Guest => "GUEST",
        }
    }
}

impl std::str::FromStr for UserType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "MEMBER" => Ok(UserType::Member),
            "GUEST" => Ok(UserType::Guest),
            other => Err(format!("unknown user type '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(type_name = "reservation_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Virtual-account reservation waiting for the deposit webhook.
    ConfirmedPending,
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationAction {
    Confirm,
    Cancel,
}

impl ReservationStatus {
    /// Transition table: `Ok(next)` when `action` is legal from `self`,
    /// otherwise the reason it is not.
    pub fn transition(self, action: ReservationAction) -> Result<ReservationStatus, &'static str> {
        use ReservationAction::*;
        use ReservationStatus::*;

        match (self, action) {
            (ConfirmedPending, Confirm) => Ok(Confirmed),
            (ConfirmedPending, Cancel) | (Confirmed, Cancel) => Ok(Cancelled),
            (Confirmed, Confirm) => Err("already confirmed"),
            (Cancelled, _) => Err("already cancelled"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::ConfirmedPending => "CONFIRMED_PENDING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub id: Uuid,
    pub expo_id: Uuid,
    pub ticket_id: Uuid,
    pub reservation_code: String,
    pub user_type: UserType,
    pub user_id: Uuid,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn is_owned_by(&self, actor: &Actor) -> bool {
        self.user_id == actor.id && self.user_type == actor.user_type
    }
}

/// One named ticket holder inside a reservation; owns at most one live QR code.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reserver {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub name: String,
    pub phone: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Identity details collected at reservation start, one per ticket holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserverDetails {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
}

impl ReserverDetails {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("reserver name must not be blank".to_string());
        }
        let digits = self.phone.chars().filter(|c| c.is_ascii_digit()).count();
        if digits < 7 {
            return Err(format!("reserver phone '{}' is not a valid number", self.phone));
        }
        Ok(())
    }
}

/// The caller of an operation, passed explicitly instead of read from ambient context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub user_type: UserType,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_reservation_can_confirm_or_cancel() {
        assert_eq!(
            ReservationStatus::ConfirmedPending.transition(ReservationAction::Confirm),
            Ok(ReservationStatus::Confirmed)
        );
        assert_eq!(
            ReservationStatus::ConfirmedPending.transition(ReservationAction::Cancel),
            Ok(ReservationStatus::Cancelled)
        );
    }

    #[test]
    fn test_cancelled_is_terminal() {
        for action in [ReservationAction::Confirm, ReservationAction::Cancel] {
            assert_eq!(
                ReservationStatus::Cancelled.transition(action),
                Err("already cancelled")
            );
        }
        assert_eq!(
            ReservationStatus::Confirmed.transition(ReservationAction::Confirm),
            Err("already confirmed")
        );
    }

    #[test]
    fn test_reserver_details_validation() {
        let ok = ReserverDetails {
            name: "Kim Minji".into(),
            phone: "010-1234-5678".into(),
            email: None,
        };
        assert!(ok.validate().is_ok());

        let blank = ReserverDetails {
            name: "  ".into(),
            ..ok.clone()
        };
        assert!(blank.validate().is_err());

        let short = ReserverDetails {
            phone: "12".into(),
            ..ok
        };
        assert!(short.validate().is_err());
    }

    #[test]
    fn test_user_type_parses_case_insensitively() {
        assert_eq!("guest".parse::<UserType>(), Ok(UserType::Guest));
        assert!("admin".parse::<UserType>().is_err());
    }
}
