use async_trait::async_trait;
use uuid::Uuid;

use super::endpoint;
use crate::utils::error::AppError;

/// Renders a QR token to an image and returns its durable URL.
#[async_trait]
pub trait QrImageStore: Send + Sync {
    async fn store(&self, qr_id: Uuid, token: &str) -> Result<String, AppError>;
}

/// Points at `{base_url}/qr/{qr_id}.png` without rendering anything itself.
///
/// The image host behind `base_url` renders on request: it looks the code up
/// by id in `qr_codes` and encodes the token it finds there. The token is
/// therefore never part of a link, and a reissued code gets a new id and a
/// new image. `store` fails only for an empty token or a base url that cannot
/// carry a path; outages of the image host surface when the link is opened.
pub struct PublicUrlImageStore {
    base_url: String,
}

impl PublicUrlImageStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl QrImageStore for PublicUrlImageStore {
    async fn store(&self, qr_id: Uuid, token: &str) -> Result<String, AppError> {
        if token.is_empty() {
            return Err(AppError::ValidationError("empty QR token".to_string()));
        }
        let url = endpoint(&self.base_url, &["qr".to_string(), format!("{qr_id}.png")])?;
        Ok(url.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_url_is_keyed_by_id() {
        let store = PublicUrlImageStore::new("https://cdn.example.com/");
        let id = Uuid::nil();
        let url = store.store(id, "secret-token").await.unwrap();
        assert_eq!(url, format!("https://cdn.example.com/qr/{id}.png"));
        assert!(!url.contains("secret-token"));
    }

    #[tokio::test]
    async fn test_base_path_is_kept() {
        let store = PublicUrlImageStore::new("https://cdn.example.com/static");
        let id = Uuid::new_v4();
        let url = store.store(id, "token").await.unwrap();
        assert_eq!(url, format!("https://cdn.example.com/static/qr/{id}.png"));
    }

    #[tokio::test]
    async fn test_unusable_inputs_fail() {
        let store = PublicUrlImageStore::new("https://cdn.example.com");
        assert!(matches!(
            store.store(Uuid::new_v4(), "").await,
            Err(AppError::ValidationError(_))
        ));

        let misconfigured = PublicUrlImageStore::new("cdn.example.com");
        assert!(matches!(
            misconfigured.store(Uuid::new_v4(), "token").await,
            Err(AppError::InternalServerError(_))
        ));
    }
}
