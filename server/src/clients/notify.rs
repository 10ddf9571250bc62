//! Fire-and-forget notifications.
//!
//! Services hand events to [`NotificationDispatcher::fire`], which only queues
//! them. A background worker delivers each event and logs failures; nothing
//! in the reservation flow waits for or depends on delivery.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::utils::error::AppError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    ReservationConfirmed {
        reservation_id: Uuid,
        reservation_code: String,
        user_id: Uuid,
    },
    AwaitingDeposit {
        reservation_id: Uuid,
        reservation_code: String,
        user_id: Uuid,
        amount: Decimal,
    },
    QrIssued {
        qr_id: Uuid,
        reserver_id: Uuid,
    },
    ReservationCancelled {
        reservation_id: Uuid,
        user_id: Uuid,
        refund_amount: Decimal,
    },
}

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationEvent::ReservationConfirmed { .. } => "reservation_confirmed",
            NotificationEvent::AwaitingDeposit { .. } => "awaiting_deposit",
            NotificationEvent::QrIssued { .. } => "qr_issued",
            NotificationEvent::ReservationCancelled { .. } => "reservation_cancelled",
        }
    }
}

/// Delivery channel (mail, SSE, push). Lives outside this service.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), AppError>;
}

/// Writes events to the log; the default when no delivery channel is wired up.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, event: &NotificationEvent) -> Result<(), AppError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| AppError::InternalServerError(format!("encode notification: {e}")))?;
        tracing::info!(kind = event.kind(), %payload, "Notification");
        Ok(())
    }
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: UnboundedSender<NotificationEvent>,
}

impl NotificationDispatcher {
    /// Dispatcher plus the receiving end, for callers that drain events themselves.
    pub fn channel() -> (Self, UnboundedReceiver<NotificationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Spawn a worker that delivers every fired event through `notifier`.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (dispatcher, mut rx) = Self::channel();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(e) = notifier.deliver(&event).await {
                    tracing::warn!(kind = event.kind(), error = %e, "Notification delivery failed");
                }
            }
        });
        dispatcher
    }

    pub fn fire(&self, event: NotificationEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::warn!(kind = e.0.kind(), "Notification dropped: dispatcher closed");
        }
    }
}
