use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

use super::PreReservationCache;
use crate::models::intent::PreReservationIntent;
use crate::utils::error::AppError;

const KEY_PREFIX: &str = "pre-reservation:";

/// Intents stored as JSON under `pre-reservation:{session_id}` with `SET EX`.
#[derive(Clone)]
pub struct RedisPreReservationCache {
    conn: ConnectionManager,
}

impl RedisPreReservationCache {
    pub async fn connect(redis_url: &str) -> Result<Self, AppError> {
        let client = Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis pre-reservation cache");
        Ok(Self { conn })
    }

    fn key(session_id: &str) -> String {
        format!("{KEY_PREFIX}{session_id}")
    }
}

#[async_trait]
impl PreReservationCache for RedisPreReservationCache {
    async fn set(
        &self,
        session_id: &str,
        intent: &PreReservationIntent,
        ttl: Duration,
    ) -> Result<(), AppError> {
        let payload = serde_json::to_string(intent)
            .map_err(|e| AppError::InternalServerError(format!("encode intent: {e}")))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(Self::key(session_id), payload, ttl.as_secs().max(1))
            .await?;
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<PreReservationIntent>, AppError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.get(Self::key(session_id)).await?;

        Ok(payload.and_then(|raw| match serde_json::from_str(&raw) {
            Ok(intent) => Some(intent),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "Discarding malformed pre-reservation");
                None
            }
        }))
    }

    async fn delete(&self, session_id: &str) -> Result<(), AppError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(Self::key(session_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced() {
        assert_eq!(
            RedisPreReservationCache::key("abc"),
            "pre-reservation:abc"
        );
    }
}
