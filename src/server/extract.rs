//! Request extractors shared by the catalog routes.

use axum::extract::rejection::RawPathParamsRejection;
use axum::extract::{FromRequestParts, RawPathParams};
use axum::http::{header, request::Parts};
use serde::Deserialize;

use super::response::ApiError;

/// The `{workspace}` path segment of workspace-scoped routes. `None` on the
/// unscoped routes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workspace(pub Option<String>);

impl Workspace {
    /// Entities outside the requested workspace are reported as missing.
    pub fn ensure(&self, actual: Option<&str>, what: &str) -> Result<(), ApiError> {
        match &self.0 {
            Some(requested) if actual != Some(requested.as_str()) => {
                Err(ApiError::not_found(format!("{what} not found")))
            }
            _ => Ok(()),
        }
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Workspace {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match RawPathParams::from_request_parts(parts, state).await {
            Ok(params) => Ok(Workspace(
                params
                    .iter()
                    .find(|(key, _)| *key == "workspace")
                    .map(|(_, value)| value.to_string()),
            )),
            Err(RawPathParamsRejection::MissingPathParams(_)) => Ok(Workspace(None)),
            Err(e) => Err(ApiError::bad_request(e.body_text())),
        }
    }
}

/// Stamp from an `If-Match` header. Writes without one are unconditional.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpectedStamp(pub Option<i64>);

fn parse_if_match(raw: &str) -> Option<Option<i64>> {
    let raw = raw.trim();
    if raw == "*" {
        return Some(None);
    }
    let raw = raw.strip_prefix("W/").unwrap_or(raw).trim_matches('"');
    raw.parse().ok().map(Some)
}

impl<S: Send + Sync> FromRequestParts<S> for ExpectedStamp {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(value) = parts.headers.get(header::IF_MATCH) else {
            return Ok(ExpectedStamp(None));
        };
        value
            .to_str()
            .ok()
            .and_then(parse_if_match)
            .map(ExpectedStamp)
            .ok_or_else(|| ApiError::bad_request("If-Match must carry a numeric stamp"))
    }
}

#[derive(Debug, Deserialize)]
pub struct IdPath {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct VersionPath {
    /// The app template id.
    pub id: String,
    pub version_id: String,
}
