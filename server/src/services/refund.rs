//! Cancellation fees and the cancellation flow.
//!
//! [`RefundPolicy::quote`] is pure: given the reservation, its payment record,
//! the expo start and `now`, it always yields the same [`RefundQuote`].
//! [`RefundService::cancel_reservation`] applies a quote in one unit of work.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::clients::notify::{NotificationDispatcher, NotificationEvent};
use crate::clients::payment::PaymentProvider;
use crate::models::payment::{PaymentStatus, ReservationPaymentInfo};
use crate::models::reservation::{
    Actor, Reservation, ReservationAction, ReservationStatus, UserType,
};
use crate::services::inventory::InventoryLedger;
use crate::services::mileage;
use crate::services::qr::QrLifecycle;
use crate::store::{finish, Store, UnitOfWork};
use crate::utils::clock::Clock;
use crate::utils::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundReference {
    /// Tiers measure time elapsed since the reservation was made.
    AfterReservation,
    /// Tiers measure time left until the expo starts.
    BeforeExpoStart,
}

impl FromStr for RefundReference {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "AFTER_RESERVATION" => Ok(RefundReference::AfterReservation),
            "BEFORE_EXPO_START" => Ok(RefundReference::BeforeExpoStart),
            other => Err(format!("unknown refund reference '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundTier {
    pub threshold: Duration,
    /// Fee charged, as a percentage of the paid amount.
    pub percent: Decimal,
}

impl RefundTier {
    pub fn new(hours: i64, percent: Decimal) -> Self {
        Self {
            threshold: Duration::hours(hours),
            percent,
        }
    }

    fn describe(&self, reference: RefundReference) -> String {
        let hours = self.threshold.num_hours();
        match reference {
            RefundReference::AfterReservation => format!(
                "{}% cancellation fee ({}h or more after reservation)",
                self.percent, hours
            ),
            RefundReference::BeforeExpoStart => format!(
                "{}% cancellation fee (within {}h of expo start)",
                self.percent, hours
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RefundPolicy {
    pub reference: RefundReference,
    pub tiers: Vec<RefundTier>,
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            reference: RefundReference::BeforeExpoStart,
            tiers: vec![
                RefundTier::new(168, Decimal::from(10)),
                RefundTier::new(72, Decimal::from(20)),
                RefundTier::new(24, Decimal::from(30)),
            ],
        }
    }
}

impl RefundPolicy {
    /// Parse `hours:percent` pairs separated by commas, e.g. `"168:10,72:20,24:30"`.
    pub fn parse_tiers(raw: &str) -> Result<Vec<RefundTier>, String> {
        let mut tiers = Vec::new();
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (hours, percent) = entry
                .split_once(':')
                .ok_or_else(|| format!("tier '{entry}' is not hours:percent"))?;
            let hours: i64 = hours
                .trim()
                .parse()
                .map_err(|e| format!("tier '{entry}': bad hours: {e}"))?;
            let percent: Decimal = percent
                .trim()
                .parse()
                .map_err(|e| format!("tier '{entry}': bad percent: {e}"))?;
            if hours < 0 {
                return Err(format!("tier '{entry}': hours must not be negative"));
            }
            if percent < Decimal::ZERO || percent > Decimal::ONE_HUNDRED {
                return Err(format!("tier '{entry}': percent must be within 0..=100"));
            }
            tiers.push(RefundTier::new(hours, percent));
        }
        if tiers.is_empty() {
            return Err("no refund tiers given".to_string());
        }
        Ok(tiers)
    }

    /// Tier that applies at `now`, or `None` when no fee is due yet.
    pub fn select_tier(
        &self,
        reserved_at: DateTime<Utc>,
        expo_starts_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<&RefundTier> {
        match self.reference {
            RefundReference::AfterReservation => {
                let elapsed = now - reserved_at;
                self.tiers
                    .iter()
                    .filter(|t| t.threshold <= elapsed)
                    .max_by_key(|t| t.threshold)
            }
            RefundReference::BeforeExpoStart => {
                let remaining = expo_starts_at - now;
                self.tiers
                    .iter()
                    .filter(|t| t.threshold >= remaining)
                    .min_by_key(|t| t.threshold)
            }
        }
    }

    pub fn quote(
        &self,
        reservation: &Reservation,
        payment: &ReservationPaymentInfo,
        expo_starts_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RefundQuote {
        let original_amount = match payment.status {
            PaymentStatus::Paid => payment.total_amount,
            _ => Decimal::ZERO,
        };

        let tier = self.select_tier(reservation.created_at, expo_starts_at, now);
        let fee_percent = tier.map(|t| t.percent).unwrap_or(Decimal::ZERO);
        let refund_fee = (original_amount * fee_percent / Decimal::ONE_HUNDRED).floor();

        RefundQuote {
            reservation_id: reservation.id,
            original_amount,
            refund_fee,
            actual_refund_amount: original_amount - refund_fee,
            restore_mileage: payment.used_mileage,
            deduct_mileage: payment.saved_mileage,
            fee_percent,
            fee_description: tier
                .map(|t| t.describe(self.reference))
                .unwrap_or_else(|| "No cancellation fee".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefundQuote {
    pub reservation_id: Uuid,
    pub original_amount: Decimal,
    pub refund_fee: Decimal,
    pub actual_refund_amount: Decimal,
    /// Mileage spent on the reservation, given back on cancellation.
    pub restore_mileage: i64,
    /// Mileage earned by the reservation, taken back on cancellation.
    pub deduct_mileage: i64,
    pub fee_percent: Decimal,
    pub fee_description: String,
}

impl RefundQuote {
    pub fn mileage_delta(&self) -> i64 {
        self.restore_mileage - self.deduct_mileage
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Cancellation {
    pub reservation_id: Uuid,
    pub status: ReservationStatus,
    pub payment_status: PaymentStatus,
    pub quote: RefundQuote,
    pub expired_qr_codes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowLock {
    None,
    ForUpdate,
}

pub struct RefundService {
    store: Arc<dyn Store>,
    provider: Arc<dyn PaymentProvider>,
    notifications: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    policy: RefundPolicy,
}

impl RefundService {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn PaymentProvider>,
        notifications: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        policy: RefundPolicy,
    ) -> Self {
        Self {
            store,
            provider,
            notifications,
            clock,
            policy,
        }
    }

    pub async fn calculate_refund(
        &self,
        reservation_id: Uuid,
        actor: &Actor,
    ) -> Result<RefundQuote, AppError> {
        let mut uow = self.store.begin().await?;
        let outcome = self
            .quote_in(uow.as_mut(), reservation_id, actor, RowLock::None)
            .await;
        // Read only; nothing to keep.
        if let Err(e) = uow.rollback().await {
            tracing::warn!(error = ?e, "Rollback after refund quote failed");
        }
        outcome.map(|(_, _, quote)| quote)
    }

    pub async fn cancel_reservation(
        &self,
        reservation_id: Uuid,
        actor: &Actor,
        reason: &str,
    ) -> Result<Cancellation, AppError> {
        let mut uow = self.store.begin().await?;
        let outcome = self
            .cancel_in(uow.as_mut(), reservation_id, actor, reason)
            .await;
        let (cancellation, user_id) = finish(uow, outcome).await?;

        tracing::info!(
            %reservation_id,
            actor_id = %actor.id,
            refund = %cancellation.quote.actual_refund_amount,
            fee = %cancellation.quote.refund_fee,
            "Reservation cancelled"
        );
        self.notifications
            .fire(NotificationEvent::ReservationCancelled {
                reservation_id,
                user_id,
                refund_amount: cancellation.quote.actual_refund_amount,
            });

        Ok(cancellation)
    }

    async fn quote_in(
        &self,
        uow: &mut dyn UnitOfWork,
        reservation_id: Uuid,
        actor: &Actor,
        lock: RowLock,
    ) -> Result<(Reservation, ReservationPaymentInfo, RefundQuote), AppError> {
        let reservation = match lock {
            RowLock::ForUpdate => uow.reservation_for_update(reservation_id).await?,
            RowLock::None => uow.reservation(reservation_id).await?,
        }
        .ok_or_else(|| AppError::NotFound(format!("reservation {reservation_id}")))?;

        if !reservation.is_owned_by(actor) {
            return Err(AppError::Forbidden(
                "reservation belongs to another user".to_string(),
            ));
        }
        if reservation.status == ReservationStatus::Cancelled {
            return Err(AppError::ReservationStateConflict(format!(
                "reservation {reservation_id} is already cancelled"
            )));
        }

        let payment = uow.payment_info(reservation_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("payment record for reservation {reservation_id}"))
        })?;
        let expo = uow
            .expo(reservation.expo_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("expo {}", reservation.expo_id)))?;

        let quote = self
            .policy
            .quote(&reservation, &payment, expo.starts_at, self.clock.now());
        Ok((reservation, payment, quote))
    }

    async fn cancel_in(
        &self,
        uow: &mut dyn UnitOfWork,
        reservation_id: Uuid,
        actor: &Actor,
        reason: &str,
    ) -> Result<(Cancellation, Uuid), AppError> {
        let now = self.clock.now();
        let (reservation, payment, quote) = self
            .quote_in(uow, reservation_id, actor, RowLock::ForUpdate)
            .await?;

        let next = reservation
            .status
            .transition(ReservationAction::Cancel)
            .map_err(|reason| {
                AppError::ReservationStateConflict(format!(
                    "reservation {reservation_id} {reason}"
                ))
            })?;

        // Member row before the ticket row, matching completion.
        if reservation.user_type == UserType::Member {
            mileage::apply_delta_in(uow, reservation.user_id, quote.mileage_delta()).await?;
        }

        InventoryLedger::restore_in(uow, reservation.ticket_id, reservation.quantity).await?;

        let expired_qr_codes =
            QrLifecycle::expire_for_reservation_in(uow, reservation_id, now).await?;
        uow.set_reservation_status(reservation_id, next, now).await?;

        let payment_status = match payment.status {
            PaymentStatus::Paid => {
                uow.set_payment_status(
                    reservation_id,
                    PaymentStatus::Refunded,
                    Some(quote.actual_refund_amount),
                    now,
                )
                .await?;
                if quote.actual_refund_amount > Decimal::ZERO {
                    // Last step: a refused refund rolls every reversal above back.
                    self.provider
                        .refund(&payment.payment_ref, quote.actual_refund_amount, reason)
                        .await?;
                }
                PaymentStatus::Refunded
            }
            PaymentStatus::Pending => {
                uow.set_payment_status(reservation_id, PaymentStatus::Cancelled, None, now)
                    .await?;
                PaymentStatus::Cancelled
            }
            other => {
                return Err(AppError::ReservationStateConflict(format!(
                    "payment for reservation {reservation_id} is already {}",
                    other.as_str()
                )))
            }
        };

        Ok((
            Cancellation {
                reservation_id,
                status: next,
                payment_status,
                quote,
                expired_qr_codes,
            },
            reservation.user_id,
        ))
    }
}

impl fmt::Display for RefundReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RefundReference::AfterReservation => "AFTER_RESERVATION",
            RefundReference::BeforeExpoStart => "BEFORE_EXPO_START",
        })
    }
}
