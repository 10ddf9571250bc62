use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{Store, UnitOfWork};
use crate::models::expo::Expo;
use crate::models::member::Member;
use crate::models::payment::{PaymentStatus, ReservationPaymentInfo};
use crate::models::qr_code::{QrCode, QrStatus};
use crate::models::reservation::{Reservation, ReservationStatus, Reserver};
use crate::models::ticket::Ticket;
use crate::utils::error::AppError;

#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub expos: HashMap<Uuid, Expo>,
    pub tickets: HashMap<Uuid, Ticket>,
    pub members: HashMap<Uuid, Member>,
    pub reservations: HashMap<Uuid, Reservation>,
    pub reservers: HashMap<Uuid, Reserver>,
    pub payments: HashMap<Uuid, ReservationPaymentInfo>,
    pub qr_codes: HashMap<Uuid, QrCode>,
}

/// Row kinds a unit of work locks, declared in the order flows take them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockedRow {
    Reservation,
    Member,
    Ticket,
    Qr,
}

/// Process-local store. A unit of work holds the store-wide lock from `begin`
/// until commit or rollback and edits a private copy, so transactions are
/// fully serialized and a dropped unit of work leaves no trace.
///
/// Row locks are no-ops here, but each finished unit of work records the
/// ones it asked for so lock ordering can be checked without a database.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    lock_journal: Arc<Mutex<Vec<Vec<LockedRow>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_expo(&self, expo: Expo) {
        self.state.lock().await.expos.insert(expo.id, expo);
    }

    pub async fn insert_ticket(&self, ticket: Ticket) {
        self.state.lock().await.tickets.insert(ticket.id, ticket);
    }

    pub async fn insert_member(&self, member: Member) {
        self.state.lock().await.members.insert(member.id, member);
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    /// Row locks requested by each finished unit of work, oldest first.
    pub async fn lock_history(&self) -> Vec<Vec<LockedRow>> {
        self.lock_journal.lock().await.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork {
            guard: Some(guard),
            working,
            locks: Vec::new(),
            journal: Arc::clone(&self.lock_journal),
        }))
    }
}

pub struct MemoryUnitOfWork {
    guard: Option<OwnedMutexGuard<MemoryState>>,
    working: MemoryState,
    locks: Vec<LockedRow>,
    journal: Arc<Mutex<Vec<Vec<LockedRow>>>>,
}

impl MemoryUnitOfWork {
    fn state(&mut self) -> Result<&mut MemoryState, AppError> {
        if self.guard.is_none() {
            return Err(AppError::InternalServerError(
                "unit of work already finished".to_string(),
            ));
        }
        Ok(&mut self.working)
    }

    fn lock(&mut self, row: LockedRow) -> Result<&mut MemoryState, AppError> {
        self.locks.push(row);
        self.state()
    }

    async fn record_locks(&mut self) {
        let locks = std::mem::take(&mut self.locks);
        self.journal.lock().await.push(locks);
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn expo(&mut self, id: Uuid) -> Result<Option<Expo>, AppError> {
        Ok(self.state()?.expos.get(&id).cloned())
    }

    async fn ticket(&mut self, id: Uuid) -> Result<Option<Ticket>, AppError> {
        Ok(self.state()?.tickets.get(&id).cloned())
    }

    async fn try_decrement_inventory(
        &mut self,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<Option<i32>, AppError> {
        let Some(ticket) = self.lock(LockedRow::Ticket)?.tickets.get_mut(&ticket_id) else {
            return Ok(None);
        };
        if ticket.remaining_quantity < quantity {
            return Ok(None);
        }
        ticket.remaining_quantity -= quantity;
        Ok(Some(ticket.remaining_quantity))
    }

    async fn try_restore_inventory(
        &mut self,
        ticket_id: Uuid,
        quantity: i32,
    ) -> Result<Option<i32>, AppError> {
        let Some(ticket) = self.lock(LockedRow::Ticket)?.tickets.get_mut(&ticket_id) else {
            return Ok(None);
        };
        if ticket.remaining_quantity + quantity > ticket.total_quantity {
            return Ok(None);
        }
        ticket.remaining_quantity += quantity;
        Ok(Some(ticket.remaining_quantity))
    }

    async fn member_for_update(&mut self, id: Uuid) -> Result<Option<Member>, AppError> {
        Ok(self.lock(LockedRow::Member)?.members.get(&id).cloned())
    }

    async fn set_mileage(&mut self, member_id: Uuid, balance: i64) -> Result<(), AppError> {
        let member = self
            .state()?
            .members
            .get_mut(&member_id)
            .ok_or_else(|| AppError::NotFound(format!("member {member_id}")))?;
        member.mileage = balance;
        Ok(())
    }

    async fn reservation_code_exists(&mut self, code: &str) -> Result<bool, AppError> {
        Ok(self
            .state()?
            .reservations
            .values()
            .any(|r| r.reservation_code == code))
    }

    async fn insert_reservation(&mut self, reservation: &Reservation) -> Result<(), AppError> {
        self.state()?
            .reservations
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn reservation(&mut self, id: Uuid) -> Result<Option<Reservation>, AppError> {
        Ok(self.state()?.reservations.get(&id).cloned())
    }

    async fn reservation_for_update(&mut self, id: Uuid) -> Result<Option<Reservation>, AppError> {
        Ok(self.lock(LockedRow::Reservation)?.reservations.get(&id).cloned())
    }

    async fn set_reservation_status(
        &mut self,
        id: Uuid,
        status: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let reservation = self
            .state()?
            .reservations
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("reservation {id}")))?;
        reservation.status = status;
        reservation.updated_at = at;
        Ok(())
    }

    async fn insert_reserver(&mut self, reserver: &Reserver) -> Result<(), AppError> {
        self.state()?.reservers.insert(reserver.id, reserver.clone());
        Ok(())
    }

    async fn reserver(&mut self, id: Uuid) -> Result<Option<Reserver>, AppError> {
        Ok(self.state()?.reservers.get(&id).cloned())
    }

    async fn reservers_for(&mut self, reservation_id: Uuid) -> Result<Vec<Reserver>, AppError> {
        let mut reservers: Vec<Reserver> = self
            .state()?
            .reservers
            .values()
            .filter(|r| r.reservation_id == reservation_id)
            .cloned()
            .collect();
        reservers.sort_by_key(|r| (r.created_at, r.id));
        Ok(reservers)
    }

    async fn insert_payment_info(&mut self, info: &ReservationPaymentInfo) -> Result<(), AppError> {
        let state = self.state()?;
        if state.payments.values().any(|p| p.payment_ref == info.payment_ref) {
            return Err(AppError::DuplicatePayment(info.payment_ref.clone()));
        }
        state.payments.insert(info.reservation_id, info.clone());
        Ok(())
    }

    async fn payment_info(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Option<ReservationPaymentInfo>, AppError> {
        Ok(self.state()?.payments.get(&reservation_id).cloned())
    }

    async fn payment_info_by_ref(
        &mut self,
        payment_ref: &str,
    ) -> Result<Option<ReservationPaymentInfo>, AppError> {
        Ok(self
            .state()?
            .payments
            .values()
            .find(|p| p.payment_ref == payment_ref)
            .cloned())
    }

    async fn set_payment_status(
        &mut self,
        reservation_id: Uuid,
        status: PaymentStatus,
        refunded_amount: Option<Decimal>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let info = self
            .state()?
            .payments
            .get_mut(&reservation_id)
            .ok_or_else(|| AppError::NotFound(format!("payment for reservation {reservation_id}")))?;
        info.status = status;
        if refunded_amount.is_some() {
            info.refunded_amount = refunded_amount;
        }
        info.updated_at = at;
        Ok(())
    }

    async fn qr_token_exists(&mut self, token: &str) -> Result<bool, AppError> {
        Ok(self.state()?.qr_codes.values().any(|q| q.token == token))
    }

    async fn insert_qr(&mut self, qr: &QrCode) -> Result<(), AppError> {
        let state = self.state()?;
        let unexpired = |q: &QrCode| q.status != QrStatus::Expired;
        let taken = state
            .qr_codes
            .values()
            .any(|q| q.reserver_id == qr.reserver_id && unexpired(q));
        if taken && unexpired(qr) {
            return Err(AppError::InternalServerError(format!(
                "reserver {} already holds an unexpired QR code",
                qr.reserver_id
            )));
        }
        state.qr_codes.insert(qr.id, qr.clone());
        Ok(())
    }

    async fn qr(&mut self, id: Uuid) -> Result<Option<QrCode>, AppError> {
        Ok(self.state()?.qr_codes.get(&id).cloned())
    }

    async fn qr_for_update(&mut self, id: Uuid) -> Result<Option<QrCode>, AppError> {
        Ok(self.lock(LockedRow::Qr)?.qr_codes.get(&id).cloned())
    }

    async fn qr_by_token(&mut self, token: &str) -> Result<Option<QrCode>, AppError> {
        Ok(self
            .state()?
            .qr_codes
            .values()
            .find(|q| q.token == token)
            .cloned())
    }

    async fn qr_by_token_for_update(&mut self, token: &str) -> Result<Option<QrCode>, AppError> {
        self.locks.push(LockedRow::Qr);
        self.qr_by_token(token).await
    }

    async fn live_qrs_for_reservation(
        &mut self,
        reservation_id: Uuid,
    ) -> Result<Vec<QrCode>, AppError> {
        let state: &MemoryState = self.lock(LockedRow::Qr)?;
        Ok(state
            .qr_codes
            .values()
            .filter(|q| q.status.is_live())
            .filter(|q| {
                state
                    .reservers
                    .get(&q.reserver_id)
                    .is_some_and(|r| r.reservation_id == reservation_id)
            })
            .cloned()
            .collect())
    }

    async fn qrs_due_for_sweep(
        &mut self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<QrCode>, AppError> {
        Ok(self
            .lock(LockedRow::Qr)?
            .qr_codes
            .values()
            .filter(|q| q.status.is_live() && q.effective_status(now) != q.status)
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn qrs_missing_image(&mut self, limit: i64) -> Result<Vec<QrCode>, AppError> {
        Ok(self
            .lock(LockedRow::Qr)?
            .qr_codes
            .values()
            .filter(|q| q.image_url.is_none() && q.status.is_live())
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn update_qr(&mut self, qr: &QrCode) -> Result<(), AppError> {
        let stored = self
            .state()?
            .qr_codes
            .get_mut(&qr.id)
            .ok_or_else(|| AppError::NotFound(format!("QR code {}", qr.id)))?;
        *stored = qr.clone();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), AppError> {
        match self.guard.take() {
            Some(mut guard) => {
                *guard = std::mem::take(&mut self.working);
                self.record_locks().await;
                Ok(())
            }
            None => Err(AppError::InternalServerError(
                "unit of work already finished".to_string(),
            )),
        }
    }

    async fn rollback(&mut self) -> Result<(), AppError> {
        if self.guard.take().is_some() {
            self.record_locks().await;
        }
        Ok(())
    }
}
