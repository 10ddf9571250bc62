use reqwest::Url;

use crate::utils::error::AppError;

pub mod notify;
pub mod payment;
pub mod qr_image;

pub use notify::{LogNotifier, NotificationDispatcher, NotificationEvent, Notifier};
pub use payment::{HttpPaymentProvider, PaymentProvider, ProviderPayment, ProviderPaymentStatus};
pub use qr_image::{PublicUrlImageStore, QrImageStore};

/// `base_url` with `segments` appended, each percent-encoded as one path segment.
pub(crate) fn endpoint<S: AsRef<str>>(base_url: &str, segments: &[S]) -> Result<Url, AppError> {
    let mut url = Url::parse(base_url)
        .map_err(|e| AppError::InternalServerError(format!("base url {base_url}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| AppError::InternalServerError(format!("base url {base_url} cannot take a path")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
