//! Classifies a payment assertion against the provider's record.
//!
//! Verification reads the cache and the provider only. It never writes
//! durable state, so a provider timeout cannot leave inventory or reservation
//! rows half-applied: only a classified outcome reaches the orchestrator.

use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

use crate::cache::PreReservationCache;
use crate::clients::payment::{PaymentProvider, ProviderPayment, ProviderPaymentStatus};
use crate::models::intent::PreReservationIntent;
use crate::utils::error::AppError;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    AmountMismatch { expected: Decimal, actual: Decimal },
    MerchantMismatch,
    UnknownPayment,
    Declined,
    Cancelled,
    /// Provider says paid by a method we cannot hold for a deposit.
    UnexpectedState,
}

impl FailureReason {
    pub fn into_error(self) -> AppError {
        match self {
            FailureReason::AmountMismatch { expected, actual } => {
                AppError::PaymentMismatch { expected, actual }
            }
            FailureReason::MerchantMismatch => {
                AppError::PaymentFailed("payment belongs to a different session".to_string())
            }
            FailureReason::UnknownPayment => {
                AppError::PaymentFailed("payment not found at provider".to_string())
            }
            FailureReason::Declined => AppError::PaymentFailed("payment declined".to_string()),
            FailureReason::Cancelled => {
                AppError::PaymentFailed("payment was cancelled".to_string())
            }
            FailureReason::UnexpectedState => {
                AppError::PaymentFailed("payment is in an unexpected state".to_string())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyOutcome {
    Confirmed,
    PendingVbank,
    Failed(FailureReason),
}

/// A classified payment together with the inputs the orchestrator needs.
#[derive(Debug, Clone)]
pub struct Verification {
    pub outcome: VerifyOutcome,
    pub intent: PreReservationIntent,
    /// `None` only when the provider did not know the payment.
    pub provider_payment: Option<ProviderPayment>,
    pub payment_ref: String,
}

pub struct PaymentVerifier {
    cache: Arc<dyn PreReservationCache>,
    provider: Arc<dyn PaymentProvider>,
}

impl PaymentVerifier {
    pub fn new(cache: Arc<dyn PreReservationCache>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { cache, provider }
    }

    pub async fn verify_payment(
        &self,
        session_id: &str,
        payment_ref: &str,
        claimed_amount: Decimal,
    ) -> Result<Verification, AppError> {
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(AppError::SessionExpired);
        }
        if payment_ref.trim().is_empty() {
            return Err(AppError::ValidationError(
                "payment reference is required".to_string(),
            ));
        }

        let intent = self
            .cache
            .get(session_id)
            .await?
            .ok_or(AppError::SessionExpired)?;

        let provider_payment = self.provider.fetch_payment(payment_ref).await?;
        let outcome = classify(&intent, claimed_amount, provider_payment.as_ref());

        tracing::info!(
            session_id,
            payment_ref,
            outcome = ?outcome,
            "Payment verified"
        );

        Ok(Verification {
            outcome,
            intent,
            provider_payment,
            payment_ref: payment_ref.to_string(),
        })
    }
}

/// Pure classification of a provider record against the staged intent.
pub fn classify(
    intent: &PreReservationIntent,
    claimed_amount: Decimal,
    payment: Option<&ProviderPayment>,
) -> VerifyOutcome {
    let Some(payment) = payment else {
        return VerifyOutcome::Failed(FailureReason::UnknownPayment);
    };

    if payment.merchant_ref != intent.session_id {
        return VerifyOutcome::Failed(FailureReason::MerchantMismatch);
    }

    match payment.status {
        ProviderPaymentStatus::Failed => return VerifyOutcome::Failed(FailureReason::Declined),
        ProviderPaymentStatus::Cancelled => {
            return VerifyOutcome::Failed(FailureReason::Cancelled)
        }
        ProviderPaymentStatus::Paid | ProviderPaymentStatus::Ready => {}
    }

    if payment.amount != intent.payable_amount || claimed_amount != intent.payable_amount {
        let actual = if payment.amount != intent.payable_amount {
            payment.amount
        } else {
            claimed_amount
        };
        return VerifyOutcome::Failed(FailureReason::AmountMismatch {
            expected: intent.payable_amount,
            actual,
        });
    }

    match payment.status {
        ProviderPaymentStatus::Paid => VerifyOutcome::Confirmed,
        ProviderPaymentStatus::Ready if payment.is_virtual_account() => VerifyOutcome::PendingVbank,
        _ => VerifyOutcome::Failed(FailureReason::UnexpectedState),
    }
}
