use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};

use super::error::unauthorized;
use super::state::AppState;

/// Extractor for the `/admin/*` surface. Only checks that a bearer token is
/// present and non-empty; verifying the JWT signature is out of scope here
/// (see DESIGN.md) — the extractor exists so every admin handler can require
/// one via its signature rather than checking headers by hand.
pub struct AdminAuth;

impl FromRequestParts<AppState> for AdminAuth {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| unauthorized("missing Authorization header").into_response())?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("Authorization header must be a Bearer token").into_response())?;

        if token.trim().is_empty() {
            return Err(unauthorized("empty bearer token").into_response());
        }

        Ok(AdminAuth)
    }
}
