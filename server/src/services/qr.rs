//! QR credential lifecycle: issue, reissue, check-in, verification and the
//! periodic sweep that persists time-based transitions.
//!
//! Every status change goes through [`QrStatus::transition`]. Codes are
//! reclassified by the clock before any action is applied, so a stored ACTIVE
//! code past its window behaves as EXPIRED even before the sweep runs.

use chrono::{DateTime, Duration, Utc};
use rand::{distributions::Alphanumeric, Rng};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::clients::notify::{NotificationDispatcher, NotificationEvent};
use crate::clients::qr_image::QrImageStore;
use crate::models::qr_code::{QrAction, QrCode, QrStatus};
use crate::models::reservation::{Actor, Reservation, ReservationStatus};
use crate::store::{finish, Store, UnitOfWork};
use crate::utils::clock::Clock;
use crate::utils::error::AppError;

pub const TOKEN_LENGTH: usize = 32;
pub const MAX_TOKEN_ATTEMPTS: u32 = 5;
const SWEEP_BATCH: i64 = 500;

pub trait TokenGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// Alphanumeric tokens from the thread-local CSPRNG.
pub struct RandomTokens;

impl TokenGenerator for RandomTokens {
    fn generate(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LENGTH)
            .map(char::from)
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayWindow {
    pub activated_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
}

/// Read-only view returned to scanners.
#[derive(Debug, Clone, Serialize)]
pub struct QrVerification {
    pub qr_id: Uuid,
    pub reserver_id: Uuid,
    pub reservation_id: Uuid,
    pub holder_name: String,
    pub status: QrStatus,
    pub usable: bool,
    /// Why a check-in would be refused right now.
    pub reason: Option<&'static str>,
    pub activated_at: DateTime<Utc>,
    pub expired_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub activated: usize,
    pub expired: usize,
}

pub struct QrLifecycle {
    store: Arc<dyn Store>,
    images: Arc<dyn QrImageStore>,
    notifications: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    tokens: Arc<dyn TokenGenerator>,
    activation_lead: Duration,
}

impl QrLifecycle {
    pub fn new(
        store: Arc<dyn Store>,
        images: Arc<dyn QrImageStore>,
        notifications: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        activation_lead: Duration,
    ) -> Self {
        Self {
            store,
            images,
            notifications,
            clock,
            tokens: Arc::new(RandomTokens),
            activation_lead,
        }
    }

    pub fn with_token_generator(mut self, tokens: Arc<dyn TokenGenerator>) -> Self {
        self.tokens = tokens;
        self
    }

    pub async fn display_window(
        &self,
        uow: &mut dyn UnitOfWork,
        reservation: &Reservation,
    ) -> Result<DisplayWindow, AppError> {
        let ticket = uow
            .ticket(reservation.ticket_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("ticket {}", reservation.ticket_id)))?;
        let expo = uow
            .expo(reservation.expo_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("expo {}", reservation.expo_id)))?;

        let opens = ticket.valid_from.unwrap_or(expo.starts_at);
        let closes = ticket.valid_until.unwrap_or(expo.ends_at);
        let window = DisplayWindow {
            activated_at: opens - self.activation_lead,
            expired_at: closes,
        };
        if window.expired_at <= window.activated_at {
            return Err(AppError::ValidationError(format!(
                "ticket {} has an empty display window",
                ticket.id
            )));
        }
        Ok(window)
    }

    /// Issue one code for every reserver of `reservation` inside the caller's
    /// unit of work. Call [`QrLifecycle::publish`] once it has committed.
    pub async fn issue_for_reservation_in(
        &self,
        uow: &mut dyn UnitOfWork,
        reservation: &Reservation,
        now: DateTime<Utc>,
    ) -> Result<Vec<QrCode>, AppError> {
        let window = self.display_window(uow, reservation).await?;
        let reservers = uow.reservers_for(reservation.id).await?;

        let mut issued = Vec::with_capacity(reservers.len());
        for reserver in reservers {
            issued.push(self.issue_in(uow, reserver.id, window, now).await?);
        }
        Ok(issued)
    }

    pub async fn issue_in(
        &self,
        uow: &mut dyn UnitOfWork,
        reserver_id: Uuid,
        window: DisplayWindow,
        now: DateTime<Utc>,
    ) -> Result<QrCode, AppError> {
        let token = self.unique_token(uow).await?;
        let qr = QrCode {
            id: Uuid::new_v4(),
            reserver_id,
            token,
            image_url: None,
            status: QrStatus::for_window(window.activated_at, window.expired_at, now),
            activated_at: window.activated_at,
            expired_at: window.expired_at,
            used_at: None,
            created_at: now,
            updated_at: now,
        };
        uow.insert_qr(&qr).await?;
        tracing::debug!(qr_id = %qr.id, %reserver_id, status = qr.status.as_str(), "QR code issued");
        Ok(qr)
    }

    async fn unique_token(&self, uow: &mut dyn UnitOfWork) -> Result<String, AppError> {
        for attempt in 1..=MAX_TOKEN_ATTEMPTS {
            let token = self.tokens.generate();
            if !uow.qr_token_exists(&token).await? {
                return Ok(token);
            }
            tracing::warn!(attempt, "QR token collision, regenerating");
        }
        Err(AppError::TokenExhausted(MAX_TOKEN_ATTEMPTS))
    }

    /// Expire a live code and issue a fresh one for the same reserver. Only the
    /// reservation's owner may do this.
    pub async fn reissue(&self, qr_id: Uuid, actor: &Actor) -> Result<QrCode, AppError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let outcome = self.reissue_in(uow.as_mut(), qr_id, actor, now).await;
        let qr = finish(uow, outcome).await?;

        tracing::info!(old_qr_id = %qr_id, new_qr_id = %qr.id, actor_id = %actor.id, "QR code reissued");
        Ok(self.publish(vec![qr]).await.remove(0))
    }

    async fn reissue_in(
        &self,
        uow: &mut dyn UnitOfWork,
        qr_id: Uuid,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> Result<QrCode, AppError> {
        let reserver_id = uow
            .qr(qr_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("QR code {qr_id}")))?
            .reserver_id;
        let reserver = uow
            .reserver(reserver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("reserver {reserver_id}")))?;

        // Reservation row first, then the code, the same order cancellation uses.
        let reservation = uow
            .reservation_for_update(reserver.reservation_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("reservation {}", reserver.reservation_id))
            })?;
        if !reservation.is_owned_by(actor) {
            return Err(AppError::Forbidden(
                "QR code belongs to another user".to_string(),
            ));
        }
        if reservation.status != ReservationStatus::Confirmed {
            return Err(AppError::ReservationStateConflict(format!(
                "reservation {} is {}",
                reservation.id,
                reservation.status.as_str()
            )));
        }

        let mut old = uow
            .qr_for_update(qr_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("QR code {qr_id}")))?;
        old.reconcile(now);
        let status = old.status;
        old.apply(QrAction::Expire, now)
            .map_err(|reason| AppError::QrInvalidTransition { status, reason })?;
        uow.update_qr(&old).await?;

        let window = self.display_window(uow, &reservation).await?;
        self.issue_in(uow, reserver.id, window, now).await
    }

    /// Check a code in. Concurrent scans of one token serialize on the row;
    /// exactly one succeeds and the rest see USED.
    pub async fn mark_used(&self, token: &str, actor_id: Uuid) -> Result<QrCode, AppError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::ValidationError("QR token is required".to_string()));
        }

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let outcome = Self::check_in(uow.as_mut(), token, now).await;
        // A refused scan still commits any time-based reclassification.
        let result = finish(uow, outcome).await.and_then(|checked| checked);

        match &result {
            Ok(qr) => tracing::info!(qr_id = %qr.id, %actor_id, "QR code checked in"),
            Err(AppError::QrInvalidTransition { status, reason }) => tracing::info!(
                %actor_id,
                status = status.as_str(),
                reason,
                "QR check-in refused"
            ),
            Err(_) => {}
        }
        result
    }

    async fn check_in(
        uow: &mut dyn UnitOfWork,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<QrCode, AppError>, AppError> {
        let mut qr = uow
            .qr_by_token_for_update(token)
            .await?
            .ok_or_else(|| AppError::NotFound("QR code".to_string()))?;

        let reconciled = qr.reconcile(now);
        let status = qr.status;
        match qr.apply(QrAction::Use, now) {
            Ok(()) => {
                uow.update_qr(&qr).await?;
                Ok(Ok(qr))
            }
            Err(reason) => {
                if reconciled {
                    uow.update_qr(&qr).await?;
                }
                Ok(Err(AppError::QrInvalidTransition { status, reason }))
            }
        }
    }

    pub async fn verify(&self, token: &str) -> Result<QrVerification, AppError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AppError::ValidationError("QR token is required".to_string()));
        }

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let outcome = Self::verification(uow.as_mut(), token, now).await;
        if let Err(e) = uow.rollback().await {
            tracing::warn!(error = ?e, "Rollback after QR verification failed");
        }
        outcome
    }

    async fn verification(
        uow: &mut dyn UnitOfWork,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<QrVerification, AppError> {
        let qr = uow
            .qr_by_token(token)
            .await?
            .ok_or_else(|| AppError::NotFound("QR code".to_string()))?;
        let reserver = uow
            .reserver(qr.reserver_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("reserver {}", qr.reserver_id)))?;

        let status = qr.effective_status(now);
        let reason = status.transition(QrAction::Use).err();
        Ok(QrVerification {
            qr_id: qr.id,
            reserver_id: reserver.id,
            reservation_id: reserver.reservation_id,
            holder_name: reserver.name,
            status,
            usable: reason.is_none(),
            reason,
            activated_at: qr.activated_at,
            expired_at: qr.expired_at,
            used_at: qr.used_at,
        })
    }

    /// Force every live code of a reservation to EXPIRED. Returns how many changed.
    pub async fn expire_for_reservation_in(
        uow: &mut dyn UnitOfWork,
        reservation_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        let live = uow.live_qrs_for_reservation(reservation_id).await?;
        let count = live.len();
        for mut qr in live {
            let status = qr.status;
            qr.apply(QrAction::Expire, now)
                .map_err(|reason| AppError::QrInvalidTransition { status, reason })?;
            uow.update_qr(&qr).await?;
        }
        Ok(count)
    }

    /// Persist clock-driven transitions for codes whose stored status is stale.
    pub async fn sweep(&self) -> Result<SweepReport, AppError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let outcome = Self::sweep_in(uow.as_mut(), now).await;
        let report = finish(uow, outcome).await?;
        if report != SweepReport::default() {
            tracing::info!(
                activated = report.activated,
                expired = report.expired,
                "QR sweep applied"
            );
        }
        Ok(report)
    }

    async fn sweep_in(
        uow: &mut dyn UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();
        for mut qr in uow.qrs_due_for_sweep(now, SWEEP_BATCH).await? {
            if !qr.reconcile(now) {
                continue;
            }
            match qr.status {
                QrStatus::Active => report.activated += 1,
                QrStatus::Expired => report.expired += 1,
                _ => {}
            }
            uow.update_qr(&qr).await?;
        }
        Ok(report)
    }

    /// Attach images to freshly committed codes and announce them. Returns the
    /// codes with whatever image urls could be stored.
    pub async fn publish(&self, issued: Vec<QrCode>) -> Vec<QrCode> {
        let mut published = Vec::with_capacity(issued.len());
        for mut qr in issued {
            match self.attach_image(&qr).await {
                Ok(Some(url)) => qr.image_url = Some(url),
                Ok(None) => {}
                Err(e) => tracing::warn!(
                    qr_id = %qr.id,
                    error = %e,
                    "QR image not stored, left for backfill"
                ),
            }
            self.notifications.fire(NotificationEvent::QrIssued {
                qr_id: qr.id,
                reserver_id: qr.reserver_id,
            });
            published.push(qr);
        }
        published
    }

    /// Retry image rendering for codes that have none. Returns how many were fixed.
    pub async fn backfill_images(&self, limit: i64) -> Result<usize, AppError> {
        let pending = {
            let mut uow = self.store.begin().await?;
            let outcome = uow.qrs_missing_image(limit).await;
            finish(uow, outcome).await?
        };

        let mut attached = 0;
        for qr in &pending {
            match self.attach_image(qr).await {
                Ok(Some(_)) => attached += 1,
                Ok(None) => {}
                Err(e) => tracing::warn!(qr_id = %qr.id, error = %e, "QR image backfill failed"),
            }
        }
        if attached > 0 {
            tracing::info!(attached, "QR images backfilled");
        }
        Ok(attached)
    }

    async fn attach_image(&self, qr: &QrCode) -> Result<Option<String>, AppError> {
        let url = self.images.store(qr.id, &qr.token).await?;

        let mut uow = self.store.begin().await?;
        let outcome = Self::set_image_in(uow.as_mut(), qr.id, url, self.clock.now()).await;
        finish(uow, outcome).await
    }

    /// Store `url` unless another worker attached one first.
    async fn set_image_in(
        uow: &mut dyn UnitOfWork,
        qr_id: Uuid,
        url: String,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, AppError> {
        let Some(mut current) = uow.qr_for_update(qr_id).await? else {
            return Ok(None);
        };
        if current.image_url.is_some() {
            return Ok(None);
        }
        current.image_url = Some(url.clone());
        current.updated_at = now;
        uow.update_qr(&current).await?;
        Ok(Some(url))
    }
}
