//! Durable storage behind an explicit unit of work.
//!
//! Every mutating operation opens a [`UnitOfWork`] with [`Store::begin`],
//! performs all of its reads and writes through it and hands the outcome to
//! [`finish`], which commits on `Ok` and rolls back on `Err`. Entities refer to
//! each other by id only; cross-entity reads are explicit lookups here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::expo::Expo;
use crate::models::member::Member;
use crate::models::payment::{PaymentStatus, ReservationPaymentInfo};
use crate::models::qr_code::QrCode;
use crate::models::reservation::{Reservation, ReservationStatus, Reserver};
use crate::models::ticket::Ticket;
use crate::utils::error::AppError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError>;
}

/// One open transaction. Dropping it without [`UnitOfWork::commit`] discards
/// every write made through it.
///
/// Methods suffixed `_for_update` lock the returned row until the unit of work
/// ends, serializing concurrent writers on that row. Flows that lock more than
/// one kind of row take them in the order reservation, member, ticket, QR code.
#[async_trait]
pub trait UnitOfWork: Send {
    async fn expo(&mut self, id: Uuid) -> Result<Option<Expo>, AppError>;

    async fn ticket(&mut self, id: Uuid) -> Result<Option<Ticket>, AppError>;

    /// Subtract `quantity` only if at least that much remains. Returns the new
    /// remaining quantity, or `None` when the ticket is missing or short.
    async fn try_decrement_inventory(
        &mut self,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<Option<i32>, AppError>;

    /// Add `quantity` back only if the result stays within total capacity.
    async fn try_restore_inventory(
        &mut self,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<Option<i32>, AppError>;

    async fn member_for_update(&mut self, id: Uuid) -> Result<Option<Member>, AppError>;

    async fn set_mileage(&mut self, member_id: Uuid, balance: i64) -> Result<(), AppError>;

    async fn reservation_code_exists(&mut self, code: &str) -> Result<bool, AppError>;

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), AppError>;

    async fn reservation(&mut self, id: Uuid) -> Result<Option<Reservation>, AppError>;

    async fn reservation_for_update(&mut self, id: Uuid) -> Result<Option<Reservation>, AppError>;

    async fn set_reservation_status(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn insert_reserver(&mut self, reserver: &Reserver) -> Result<(), AppError>;

    async fn reserver(&mut self, id: Uuid) -> Result<Option<Reserver>, AppError>;

    async fn reservers_for(&mut self, reservation_id: Uuid) -> Result<Vec<Reserver>, AppError>;

    /// Fails with [`AppError::DuplicatePayment`] when the payment ref was already recorded.
    async fn insert_payment_info(&mut self, info: &ReservationPaymentInfo) -> Result<(), AppError>;

    async fn payment_info(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Option<ReservationPaymentInfo>, AppError>;

    async fn payment_info_by_ref(
        &mut self,
        payment_ref: &str,
    ) -> Result<Option<ReservationPaymentInfo>, AppError>;

    async fn set_payment_status(
        &mut self,
        reservation_id: Uuid,
        status: PaymentStatus,
        refunded_amount: Option<rust_decimal::Decimal>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError>;

    async fn qr_token_exists(&mut self, token: &str) -> Result<bool, AppError>;

    async fn insert_qr(&mut self, qr: &QrCode) -> Result<(), AppError>;

    async fn qr(&mut self, id: Uuid) -> Result<Option<QrCode>, AppError>;

    async fn qr_for_update(&mut self, id: Uuid) -> Result<Option<QrCode>, AppError>;

    async fn qr_by_token(&mut self, token: &str) -> Result<Option<QrCode>, AppError>;

    async fn qr_by_token_for_update(&mut self, token: &str) -> Result<Option<QrCode>, AppError>;

    /// Live (APPROVED or ACTIVE) codes of every reserver in a reservation.
    async fn live_qrs_for_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Vec<QrCode>, AppError>;

    /// Live codes whose stored status no longer matches the clock.
    async fn qrs_due_for_sweep(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QrCode>, AppError>;

    async fn qrs_missing_image(&mut self, limit: i64) -> Result<Vec<QrCode>, AppError>;

    /// Persist status, timestamps and image url of an existing code.
    async fn update_qr(&mut self, qr: &QrCode) -> Result<(), AppError>;

    async fn commit(&mut self) -> Result<(), AppError>;

    async fn rollback(&mut self) -> Result<(), AppError>;
}

/// Commit `uow` when `outcome` is `Ok`, otherwise roll it back and return the error.
pub async fn finish<T>(
    mut uow: Box<dyn UnitOfWork>,
    outcome: Result<T, AppError>,
) -> Result<T, AppError> {
    match outcome {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = uow.rollback().await {
                tracing::error!(error = ?rollback_error, "Rollback failed");
            }
            Err(e)
        }
    }
}
