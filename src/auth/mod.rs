//! Caller identity as asserted by the upstream authentication layer.
//!
//! The proxy in front of the service authenticates the caller and forwards
//! the verdict in two headers: `X-Actor` with the caller's name and
//! `X-Actor-Roles` with a comma-separated role list.

use axum::{
    Json,
    extract::FromRequestParts,
    http::{HeaderMap, StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::types::{Actor, Role};

pub const ACTOR_HEADER: &str = "x-actor";
pub const ROLES_HEADER: &str = "x-actor-roles";

/// Extractor that requires an identified caller.
pub struct RequireActor(pub Actor);

#[derive(Debug, PartialEq, Eq)]
pub enum AuthError {
    MissingActor,
    InvalidActor,
    InvalidRoles(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingActor => (
                StatusCode::UNAUTHORIZED,
                "X-Actor header required".to_string(),
            ),
            AuthError::InvalidActor => (
                StatusCode::BAD_REQUEST,
                "X-Actor header is not valid".to_string(),
            ),
            AuthError::InvalidRoles(raw) => (
                StatusCode::BAD_REQUEST,
                format!("unknown role in X-Actor-Roles '{raw}'"),
            ),
        };

        let body = json!({ "data": null, "error": message });
        (status, Json(body)).into_response()
    }
}

fn actor_from_headers(headers: &HeaderMap) -> Result<Option<Actor>, AuthError> {
    let Some(name) = headers.get(ACTOR_HEADER) else {
        return Ok(None);
    };
    let name = name
        .to_str()
        .map_err(|_| AuthError::InvalidActor)?
        .trim();
    if name.is_empty() {
        return Err(AuthError::InvalidActor);
    }

    let roles = match headers.get(ROLES_HEADER) {
        Some(raw) => {
            let raw = raw.to_str().map_err(|_| AuthError::InvalidRoles(String::new()))?;
            Role::parse_list(raw).ok_or_else(|| AuthError::InvalidRoles(raw.to_string()))?
        }
        None => Role::default(),
    };

    Ok(Some(Actor::new(name, roles)))
}

impl<S: Send + Sync> FromRequestParts<S> for RequireActor {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers)?
            .map(RequireActor)
            .ok_or(AuthError::MissingActor)
    }
}
