//! Short-lived staging of pre-reservation intents, keyed by session id.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::models::intent::PreReservationIntent;
use crate::utils::error::AppError;

pub mod redis;

pub use self::redis::RedisPreReservationCache;

#[async_trait]
pub trait PreReservationCache: Send + Sync {
    async fn set(
        &self,
        session_id: &str,
        intent: &PreReservationIntent,
        ttl: Duration,
    ) -> Result<(), AppError>;

    /// `Ok(None)` for a miss, an expired entry or an entry that no longer decodes.
    async fn get(&self, session_id: &str) -> Result<Option<PreReservationIntent>, AppError>;

    async fn delete(&self, session_id: &str) -> Result<(), AppError>;
}

/// In-process cache used when no Redis URL is configured, and in tests.
#[derive(Default)]
pub struct MemoryPreReservationCache {
    entries: Mutex<HashMap<String, (PreReservationIntent, DateTime<Utc>)>>,
}

impl MemoryPreReservationCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PreReservationCache for MemoryPreReservationCache {
    async fn set(
        &self,
        session_id: &str,
        intent: &PreReservationIntent,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| AppError::ValidationError(format!("invalid cache ttl: {e}")))?;
        let mut entries = self.entries.lock().await;
        let now = Utc::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(session_id.to_string(), (intent.clone(), now + ttl));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<PreReservationIntent>, AppError> {
        let entries = self.entries.lock().await;
        Ok(entries
            .get(session_id)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(intent, _)| intent.clone()))
    }

    async fn delete(&self, session_id: &str) -> Result<(), AppError> {
        self.entries.lock().await.remove(session_id);
        Ok(())
    }
}
