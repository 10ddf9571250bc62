use axum::{extract::FromRequestParts, http::request::Parts, response::Response};
use serde::Serialize;
use uuid::Uuid;

use crate::models::reservation::{Actor, UserType};
use crate::utils::error::AppError;
use crate::utils::response::success;

pub mod payments;
pub mod qr;
pub mod reservations;

pub const ACTOR_ID_HEADER: &str = "x-actor-id";
pub const ACTOR_TYPE_HEADER: &str = "x-actor-type";

#[derive(Serialize)]
struct HealthPayload {
    status: &'static str,
    service: &'static str,
}

pub async fn health_check() -> Response {
    let payload = HealthPayload {
        status: "ok",
        service: "expo-api",
    };

    success(payload, "Health check successful")
}

/// The caller, taken from the `X-Actor-Id` / `X-Actor-Type` headers set by
/// the authenticating gateway in front of this service.
#[axum::async_trait]
impl<S> FromRequestParts<S> for Actor
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = header_value(parts, ACTOR_ID_HEADER)?
            .parse::<Uuid>()
            .map_err(|_| AppError::AuthError(format!("malformed {ACTOR_ID_HEADER} header")))?;
        let user_type = header_value(parts, ACTOR_TYPE_HEADER)?
            .parse::<UserType>()
            .map_err(AppError::AuthError)?;

        Ok(Actor { id, user_type })
    }
}

fn header_value<'a>(parts: &'a Parts, name: &str) -> Result<&'a str, AppError> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::AuthError(format!("missing {name} header")))
}
