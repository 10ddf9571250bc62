//! Payment-provider boundary.
//!
//! The provider is the authority on whether money moved. Transport problems
//! surface as [`AppError::ProviderUnreachable`] and are never read as a
//! declined payment.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode, Url};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::endpoint;
use crate::config::PaymentProviderConfig;
use crate::utils::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderPaymentStatus {
    Paid,
    /// Virtual account issued, waiting for the deposit.
    Ready,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualAccount {
    pub bank_name: String,
    pub account_number: String,
    pub due_at: Option<DateTime<Utc>>,
}

/// The provider's authoritative record of one payment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderPayment {
    pub payment_ref: String,
    /// Our reference the payment was opened with (the pre-reservation session id).
    pub merchant_ref: String,
    pub amount: Decimal,
    pub status: ProviderPaymentStatus,
    pub method: String,
    pub vbank: Option<VirtualAccount>,
}

impl ProviderPayment {
    pub fn is_virtual_account(&self) -> bool {
        self.method.eq_ignore_ascii_case("vbank")
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// `Ok(None)` when the provider does not know the payment.
    async fn fetch_payment(&self, payment_ref: &str) -> Result<Option<ProviderPayment>, AppError>;

    async fn refund(&self, payment_ref: &str, amount: Decimal, reason: &str)
        -> Result<(), AppError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i32,
    message: Option<String>,
    response: Option<T>,
}

#[derive(Debug, Deserialize)]
struct AccessToken {
    access_token: String,
    expired_at: i64,
}

#[derive(Debug, Deserialize)]
struct PaymentRecord {
    imp_uid: String,
    merchant_uid: String,
    amount: Decimal,
    status: ProviderPaymentStatus,
    pay_method: String,
    vbank_name: Option<String>,
    vbank_num: Option<String>,
    vbank_date: Option<i64>,
}

impl From<PaymentRecord> for ProviderPayment {
    fn from(record: PaymentRecord) -> Self {
        let vbank = match (record.vbank_name, record.vbank_num) {
            (Some(bank_name), Some(account_number)) if !account_number.is_empty() => {
                Some(VirtualAccount {
                    bank_name,
                    account_number,
                    due_at: record
                        .vbank_date
                        .filter(|ts| *ts > 0)
                        .and_then(|ts| DateTime::from_timestamp(ts, 0)),
                })
            }
            _ => None,
        };

        Self {
            payment_ref: record.imp_uid,
            merchant_ref: record.merchant_uid,
            amount: record.amount,
            status: record.status,
            method: record.pay_method,
            vbank,
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    imp_key: &'a str,
    imp_secret: &'a str,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    imp_uid: &'a str,
    amount: Decimal,
    reason: &'a str,
}

/// REST client for an Iamport-style provider: token auth, payment lookup and cancel.
pub struct HttpPaymentProvider {
    http: Client,
    config: PaymentProviderConfig,
    token: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl HttpPaymentProvider {
    pub fn new(config: PaymentProviderConfig) -> Result<Self, AppError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::InternalServerError(format!("build http client: {e}")))?;
        Ok(Self {
            http,
            config,
            token: Mutex::new(None),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, AppError> {
        endpoint(&self.config.base_url, segments)
    }

    async fn access_token(&self) -> Result<String, AppError> {
        let mut cached = self.token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if *expires_at > Utc::now() + chrono::Duration::seconds(30) {
                return Ok(token.clone());
            }
        }

        let response = self
            .http
            .post(self.url(&["users", "getToken"])?)
            .json(&TokenRequest {
                imp_key: &self.config.api_key,
                imp_secret: &self.config.api_secret,
            })
            .send()
            .await
            .map_err(provider_unreachable)?;
        let envelope: Envelope<AccessToken> = decode(response).await?;
        let token = envelope.response.ok_or_else(|| {
            AppError::ExternalServiceError(format!(
                "provider token request rejected: {}",
                envelope.message.unwrap_or_default()
            ))
        })?;

        let expires_at = DateTime::from_timestamp(token.expired_at, 0).unwrap_or_else(Utc::now);
        *cached = Some((token.access_token.clone(), expires_at));
        Ok(token.access_token)
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn fetch_payment(&self, payment_ref: &str) -> Result<Option<ProviderPayment>, AppError> {
        check_payment_ref(payment_ref)?;
        let url = self.url(&["payments", payment_ref])?;
        let token = self.access_token().await?;
        let response = self
            .http
            .get(url)
            .header(reqwest::header::AUTHORIZATION, token)
            .send()
            .await
            .map_err(provider_unreachable)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let envelope: Envelope<PaymentRecord> = decode(response).await?;
        if envelope.code != 0 {
            tracing::info!(
                payment_ref,
                code = envelope.code,
                message = envelope.message.as_deref().unwrap_or(""),
                "Provider does not know payment"
            );
            return Ok(None);
        }
        Ok(envelope.response.map(ProviderPayment::from))
    }

    async fn refund(
        &self,
        payment_ref: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<(), AppError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.url(&["payments", "cancel"])?)
            .header(reqwest::header::AUTHORIZATION, token)
            .json(&RefundRequest {
                imp_uid: payment_ref,
                amount,
                reason,
            })
            .send()
            .await
            .map_err(provider_unreachable)?;

        let envelope: Envelope<serde_json::Value> = decode(response).await?;
        if envelope.code != 0 {
            return Err(AppError::ExternalServiceError(format!(
                "refund of {payment_ref} rejected: {}",
                envelope.message.unwrap_or_default()
            )));
        }
        tracing::info!(payment_ref, %amount, "Provider refund accepted");
        Ok(())
    }
}

/// Provider references are opaque ids such as `imp_123456789012`; anything
/// else never reaches a request path.
fn check_payment_ref(payment_ref: &str) -> Result<(), AppError> {
    let well_formed = !payment_ref.is_empty()
        && payment_ref.len() <= 64
        && payment_ref
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if well_formed {
        Ok(())
    } else {
        Err(AppError::ValidationError(
            "malformed payment reference".to_string(),
        ))
    }
}

fn provider_unreachable(e: reqwest::Error) -> AppError {
    AppError::ProviderUnreachable(e.to_string())
}

async fn decode<T>(response: reqwest::Response) -> Result<Envelope<T>, AppError>
where
    T: serde::de::DeserializeOwned,
{
    let status = response.status();
    if status.is_server_error() {
        return Err(AppError::ProviderUnreachable(format!(
            "provider answered {status}"
        )));
    }
    response.json::<Envelope<T>>().await.map_err(|e| {
        if e.is_timeout() {
            provider_unreachable(e)
        } else {
            AppError::ExternalServiceError(format!("unexpected provider response: {e}"))
        }
    })
}
