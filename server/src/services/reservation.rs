//! Reservation flow: stage an intent, verify the payment, then turn it into a
//! reservation in one unit of work.
//!
//! Completion order inside the unit of work is fixed: mileage check, inventory,
//! reservation, reservers, mileage, payment record, QR codes. Any failure rolls
//! all of it back. Cache cleanup, QR images and notifications run after commit
//! and never undo it.

use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::cache::PreReservationCache;
use crate::clients::notify::{NotificationDispatcher, NotificationEvent};
use crate::clients::payment::{
    PaymentProvider, ProviderPayment, ProviderPaymentStatus, VirtualAccount,
};
use crate::config::ReservationSettings;
use crate::models::intent::PreReservationIntent;
use crate::models::payment::{PaymentStatus, ReservationPaymentInfo};
use crate::models::qr_code::QrCode;
use crate::models::reservation::{
    Actor, Reservation, ReservationAction, ReservationStatus, Reserver, ReserverDetails, UserType,
};
use crate::services::inventory::InventoryLedger;
use crate::services::mileage;
use crate::services::qr::QrLifecycle;
use crate::services::verification::{PaymentVerifier, Verification, VerifyOutcome};
use crate::store::{finish, Store, UnitOfWork};
use crate::utils::clock::Clock;
use crate::utils::error::AppError;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
const CODE_SUFFIX_LENGTH: usize = 6;
const MAX_CODE_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct StartReservationRequest {
    pub expo_id: Uuid,
    pub ticket_id: Uuid,
    pub quantity: i32,
    #[serde(default)]
    pub mileage_used: i64,
    pub reservers: Vec<ReserverDetails>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartedReservation {
    pub session_id: String,
    pub payable_amount: Decimal,
    pub quantity: i32,
    pub mileage_used: i64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompletedReservation {
    pub reservation: Reservation,
    pub payment: ReservationPaymentInfo,
    pub reservers: Vec<Reserver>,
    pub qr_codes: Vec<QrCode>,
    /// Deposit instructions when the reservation waits for a bank transfer.
    pub virtual_account: Option<VirtualAccount>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Confirmed {
        reservation_id: Uuid,
        qr_codes: usize,
    },
    Cancelled {
        reservation_id: Uuid,
    },
    /// The provider is still waiting for the deposit.
    Ignored,
}

pub struct ReservationService {
    store: Arc<dyn Store>,
    cache: Arc<dyn PreReservationCache>,
    provider: Arc<dyn PaymentProvider>,
    verifier: PaymentVerifier,
    qr: Arc<QrLifecycle>,
    notifications: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    settings: ReservationSettings,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn PreReservationCache>,
        provider: Arc<dyn PaymentProvider>,
        qr: Arc<QrLifecycle>,
        notifications: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        settings: ReservationSettings,
    ) -> Self {
        Self {
            verifier: PaymentVerifier::new(Arc::clone(&cache), Arc::clone(&provider)),
            store,
            cache,
            provider,
            qr,
            notifications,
            clock,
            settings,
        }
    }

    /// Validate a purchase and stage it in the cache until the payment arrives.
    pub async fn start_reservation(
        &self,
        actor: &Actor,
        request: StartReservationRequest,
    ) -> Result<StartedReservation, AppError> {
        let mut uow = self.store.begin().await?;
        let outcome = self.price_in(uow.as_mut(), actor, &request).await;
        if let Err(e) = uow.rollback().await {
            tracing::warn!(error = ?e, "Rollback after reservation start failed");
        }
        let payable_amount = outcome?;

        let now = self.clock.now();
        let intent = PreReservationIntent {
            session_id: Uuid::new_v4().simple().to_string(),
            expo_id: request.expo_id,
            ticket_id: request.ticket_id,
            user_type: actor.user_type,
            user_id: actor.id,
            quantity: request.quantity,
            mileage_used: request.mileage_used,
            payable_amount,
            reservers: request.reservers,
            created_at: now,
        };

        let ttl = self.settings.pre_reservation_ttl;
        self.cache.set(&intent.session_id, &intent, ttl).await?;

        tracing::info!(
            session_id = %intent.session_id,
            ticket_id = %intent.ticket_id,
            user_id = %actor.id,
            quantity = intent.quantity,
            payable = %payable_amount,
            "Reservation staged"
        );

        Ok(StartedReservation {
            expires_at: now
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::minutes(30)),
            session_id: intent.session_id,
            payable_amount,
            quantity: intent.quantity,
            mileage_used: intent.mileage_used,
        })
    }

    /// Checks every start rule and returns the payable amount.
    async fn price_in(
        &self,
        uow: &mut dyn UnitOfWork,
        actor: &Actor,
        request: &StartReservationRequest,
    ) -> Result<Decimal, AppError> {
        if request.quantity < 1 {
            return Err(AppError::ValidationError(
                "quantity must be at least 1".to_string(),
            ));
        }
        if request.reservers.len() != request.quantity as usize {
            return Err(AppError::ValidationError(format!(
                "expected {} reserver details, got {}",
                request.quantity,
                request.reservers.len()
            )));
        }
        for details in &request.reservers {
            details.validate().map_err(AppError::ValidationError)?;
        }
        if request.mileage_used < 0 {
            return Err(AppError::ValidationError(
                "mileage_used must not be negative".to_string(),
            ));
        }
        if actor.user_type == UserType::Guest && request.mileage_used > 0 {
            return Err(AppError::ValidationError(
                "guests cannot use mileage".to_string(),
            ));
        }

        uow.expo(request.expo_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("expo {}", request.expo_id)))?;
        let ticket = uow
            .ticket(request.ticket_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ticket {}", request.ticket_id)))?;
        if ticket.expo_id != request.expo_id {
            return Err(AppError::ValidationError(format!(
                "ticket {} does not belong to expo {}",
                ticket.id, request.expo_id
            )));
        }

        let total = ticket.price * Decimal::from(request.quantity);
        if Decimal::from(request.mileage_used) > total {
            return Err(AppError::ValidationError(format!(
                "mileage {} exceeds the order total {}",
                request.mileage_used, total
            )));
        }

        if actor.user_type == UserType::Member {
            let member = uow
                .member_for_update(actor.id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("member {}", actor.id)))?;
            if member.mileage < request.mileage_used {
                return Err(AppError::InsufficientMileage {
                    required: request.mileage_used,
                    balance: member.mileage,
                });
            }
        }

        if ticket.remaining_quantity < request.quantity {
            return Err(AppError::InsufficientInventory {
                requested: request.quantity,
                remaining: ticket.remaining_quantity,
            });
        }

        Ok(total - Decimal::from(request.mileage_used))
    }

    /// Verify a payment assertion and complete the reservation it pays for.
    pub async fn confirm_payment(
        &self,
        session_id: &str,
        payment_ref: &str,
        claimed_amount: Decimal,
    ) -> Result<CompletedReservation, AppError> {
        let verification = self
            .verifier
            .verify_payment(session_id, payment_ref, claimed_amount)
            .await?;

        match verification.outcome.clone() {
            VerifyOutcome::Confirmed => self.complete_reservation(verification).await,
            VerifyOutcome::PendingVbank => self.complete_pending_vbank(verification).await,
            VerifyOutcome::Failed(reason) => {
                tracing::warn!(
                    session_id,
                    payment_ref,
                    reason = ?reason,
                    "Payment rejected"
                );
                Err(reason.into_error())
            }
        }
    }

    pub async fn complete_reservation(
        &self,
        verification: Verification,
    ) -> Result<CompletedReservation, AppError> {
        if verification.outcome != VerifyOutcome::Confirmed {
            return Err(AppError::ValidationError(
                "payment is not confirmed".to_string(),
            ));
        }
        self.complete(verification, false).await
    }

    pub async fn complete_pending_vbank(
        &self,
        verification: Verification,
    ) -> Result<CompletedReservation, AppError> {
        if verification.outcome != VerifyOutcome::PendingVbank {
            return Err(AppError::ValidationError(
                "payment is not awaiting a deposit".to_string(),
            ));
        }
        self.complete(verification, true).await
    }

    async fn complete(
        &self,
        verification: Verification,
        awaiting_deposit: bool,
    ) -> Result<CompletedReservation, AppError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let outcome = self
            .complete_in(uow.as_mut(), &verification, awaiting_deposit, now)
            .await;
        let mut completed = finish(uow, outcome).await?;

        self.discard_intent(&verification.intent.session_id).await;
        completed.qr_codes = self.qr.publish(completed.qr_codes).await;
        completed.virtual_account = verification
            .provider_payment
            .and_then(|payment| payment.vbank);

        let reservation = &completed.reservation;
        tracing::info!(
            reservation_id = %reservation.id,
            reservation_code = %reservation.reservation_code,
            status = reservation.status.as_str(),
            payment_ref = %completed.payment.payment_ref,
            "Reservation completed"
        );
        self.notifications.fire(if awaiting_deposit {
            NotificationEvent::AwaitingDeposit {
                reservation_id: reservation.id,
                reservation_code: reservation.reservation_code.clone(),
                user_id: reservation.user_id,
                amount: completed.payment.total_amount,
            }
        } else {
            NotificationEvent::ReservationConfirmed {
                reservation_id: reservation.id,
                reservation_code: reservation.reservation_code.clone(),
                user_id: reservation.user_id,
            }
        });

        Ok(completed)
    }

    async fn complete_in(
        &self,
        uow: &mut dyn UnitOfWork,
        verification: &Verification,
        awaiting_deposit: bool,
        now: DateTime<Utc>,
    ) -> Result<CompletedReservation, AppError> {
        let intent = &verification.intent;
        let is_member = intent.user_type == UserType::Member;

        if is_member {
            let member = uow
                .member_for_update(intent.user_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("member {}", intent.user_id)))?;
            if member.mileage < intent.mileage_used {
                return Err(AppError::InsufficientMileage {
                    required: intent.mileage_used,
                    balance: member.mileage,
                });
            }
        }

        InventoryLedger::decrement_in(uow, intent.ticket_id, intent.quantity).await?;

        let reservation = Reservation {
            id: Uuid::new_v4(),
            expo_id: intent.expo_id,
            ticket_id: intent.ticket_id,
            reservation_code: self.unique_reservation_code(uow, now).await?,
            user_type: intent.user_type,
            user_id: intent.user_id,
            quantity: intent.quantity,
            status: if awaiting_deposit {
                ReservationStatus::ConfirmedPending
            } else {
                ReservationStatus::Confirmed
            },
            created_at: now,
            updated_at: now,
        };
        uow.insert_reservation(&reservation).await?;

        let mut reservers = Vec::with_capacity(intent.reservers.len());
        for details in &intent.reservers {
            let reserver = Reserver {
                id: Uuid::new_v4(),
                reservation_id: reservation.id,
                name: details.name.trim().to_string(),
                phone: details.phone.trim().to_string(),
                email: details.email.clone(),
                created_at: now,
            };
            uow.insert_reserver(&reserver).await?;
            reservers.push(reserver);
        }

        let saved_mileage = if is_member {
            mileage::accrual(intent.payable_amount, self.settings.mileage_accrual_percent)?
        } else {
            0
        };
        if is_member {
            mileage::apply_delta_in(uow, intent.user_id, saved_mileage - intent.mileage_used)
                .await?;
        }

        let payment = ReservationPaymentInfo {
            reservation_id: reservation.id,
            payment_ref: verification.payment_ref.clone(),
            total_amount: intent.payable_amount,
            status: if awaiting_deposit {
                PaymentStatus::Pending
            } else {
                PaymentStatus::Paid
            },
            used_mileage: intent.mileage_used,
            saved_mileage,
            refunded_amount: None,
            created_at: now,
            updated_at: now,
        };
        uow.insert_payment_info(&payment).await?;

        let qr_codes = if awaiting_deposit {
            Vec::new()
        } else {
            self.qr.issue_for_reservation_in(uow, &reservation, now).await?
        };

        Ok(CompletedReservation {
            reservation,
            payment,
            reservers,
            qr_codes,
            virtual_account: None,
        })
    }

    async fn unique_reservation_code(
        &self,
        uow: &mut dyn UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<String, AppError> {
        for attempt in 1..=MAX_CODE_ATTEMPTS {
            let code = reservation_code(now);
            if !uow.reservation_code_exists(&code).await? {
                return Ok(code);
            }
            tracing::warn!(attempt, "Reservation code collision, regenerating");
        }
        Err(AppError::TokenExhausted(MAX_CODE_ATTEMPTS))
    }

    async fn discard_intent(&self, session_id: &str) {
        if let Err(e) = self.cache.delete(session_id).await {
            tracing::warn!(session_id, error = %e, "Failed to drop pre-reservation intent");
        }
    }

    /// Apply a provider notification. The provider record is re-fetched and
    /// treated as authoritative; the reservation row lock makes replays no-ops.
    pub async fn handle_payment_webhook(
        &self,
        payment_ref: &str,
    ) -> Result<WebhookOutcome, AppError> {
        let payment_ref = payment_ref.trim();
        if payment_ref.is_empty() {
            return Err(AppError::ValidationError(
                "payment reference is required".to_string(),
            ));
        }

        let payment = self
            .provider
            .fetch_payment(payment_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {payment_ref} at provider")))?;

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let outcome = self.apply_webhook_in(uow.as_mut(), &payment, now).await;
        let applied = finish(uow, outcome).await;

        match applied {
            Ok(Applied::Confirmed(reservation, qr_codes)) => {
                let count = qr_codes.len();
                self.qr.publish(qr_codes).await;
                tracing::info!(reservation_id = %reservation.id, payment_ref, "Deposit confirmed");
                self.notifications
                    .fire(NotificationEvent::ReservationConfirmed {
                        reservation_id: reservation.id,
                        reservation_code: reservation.reservation_code,
                        user_id: reservation.user_id,
                    });
                Ok(WebhookOutcome::Confirmed {
                    reservation_id: reservation.id,
                    qr_codes: count,
                })
            }
            Ok(Applied::Cancelled(reservation)) => {
                tracing::info!(reservation_id = %reservation.id, payment_ref, "Deposit abandoned, reservation cancelled");
                self.notifications
                    .fire(NotificationEvent::ReservationCancelled {
                        reservation_id: reservation.id,
                        user_id: reservation.user_id,
                        refund_amount: Decimal::ZERO,
                    });
                Ok(WebhookOutcome::Cancelled {
                    reservation_id: reservation.id,
                })
            }
            Ok(Applied::Ignored) => Ok(WebhookOutcome::Ignored),
            Err(AppError::DuplicateWebhookEvent) => {
                tracing::debug!(payment_ref, "Webhook replay ignored");
                Err(AppError::DuplicateWebhookEvent)
            }
            Err(e) => Err(e),
        }
    }

    async fn apply_webhook_in(
        &self,
        uow: &mut dyn UnitOfWork,
        payment: &ProviderPayment,
        now: DateTime<Utc>,
    ) -> Result<Applied, AppError> {
        if payment.status == ProviderPaymentStatus::Ready {
            return Ok(Applied::Ignored);
        }

        let reservation_id = uow
            .payment_info_by_ref(&payment.payment_ref)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment.payment_ref)))?
            .reservation_id;
        let mut reservation = uow
            .reservation_for_update(reservation_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("reservation {reservation_id}")))?;
        // Re-read under the lock; the first read only located the row.
        let info = uow.payment_info(reservation_id).await?.ok_or_else(|| {
            AppError::NotFound(format!("payment record for reservation {reservation_id}"))
        })?;

        match (payment.status, reservation.status) {
            (ProviderPaymentStatus::Paid, ReservationStatus::Confirmed)
            | (ProviderPaymentStatus::Failed, ReservationStatus::Cancelled)
            | (ProviderPaymentStatus::Cancelled, ReservationStatus::Cancelled) => {
                Err(AppError::DuplicateWebhookEvent)
            }
            (ProviderPaymentStatus::Paid, ReservationStatus::ConfirmedPending) => {
                if payment.amount != info.total_amount {
                    return Err(AppError::PaymentMismatch {
                        expected: info.total_amount,
                        actual: payment.amount,
                    });
                }
                reservation.status = self.transition(&reservation, ReservationAction::Confirm)?;
                reservation.updated_at = now;
                uow.set_reservation_status(reservation.id, reservation.status, now)
                    .await?;
                uow.set_payment_status(reservation.id, PaymentStatus::Paid, None, now)
                    .await?;
                let qr_codes = self
                    .qr
                    .issue_for_reservation_in(uow, &reservation, now)
                    .await?;
                Ok(Applied::Confirmed(reservation, qr_codes))
            }
            (ProviderPaymentStatus::Paid, ReservationStatus::Cancelled) => {
                tracing::error!(
                    %reservation_id,
                    payment_ref = %payment.payment_ref,
                    "Deposit received for a cancelled reservation; manual refund required"
                );
                Err(AppError::ReservationStateConflict(format!(
                    "payment {} arrived after reservation {reservation_id} was cancelled",
                    payment.payment_ref
                )))
            }
            (ProviderPaymentStatus::Ready, _) => Ok(Applied::Ignored),
            (_, ReservationStatus::ConfirmedPending) => {
                reservation.status = self.transition(&reservation, ReservationAction::Cancel)?;
                if reservation.user_type == UserType::Member {
                    mileage::apply_delta_in(
                        uow,
                        reservation.user_id,
                        info.used_mileage - info.saved_mileage,
                    )
                    .await?;
                }
                InventoryLedger::restore_in(uow, reservation.ticket_id, reservation.quantity)
                    .await?;
                uow.set_reservation_status(reservation.id, reservation.status, now)
                    .await?;
                uow.set_payment_status(reservation.id, PaymentStatus::Cancelled, None, now)
                    .await?;
                Ok(Applied::Cancelled(reservation))
            }
            (status, ReservationStatus::Confirmed) => {
                Err(AppError::ReservationStateConflict(format!(
                    "provider reports {status:?} for confirmed reservation {reservation_id}"
                )))
            }
        }
    }

    fn transition(
        &self,
        reservation: &Reservation,
        action: ReservationAction,
    ) -> Result<ReservationStatus, AppError> {
        reservation.status.transition(action).map_err(|reason| {
            AppError::ReservationStateConflict(format!(
                "reservation {} {reason}",
                reservation.id
            ))
        })
    }
}

enum Applied {
    Confirmed(Reservation, Vec<QrCode>),
    Cancelled(Reservation),
    Ignored,
}

/// Human-shareable code such as `EX250314-K7QM2X`.
fn reservation_code(now: DateTime<Utc>) -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..CODE_SUFFIX_LENGTH)
        .map(|_| char::from(CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())]))
        .collect();
    format!("EX{}-{}", now.format("%y%m%d"), suffix)
}
