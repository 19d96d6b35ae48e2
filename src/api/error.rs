use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self { error: message.into() }
    }
}

pub fn not_found(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::NOT_FOUND, Json(ErrorResponse::new(message)))
}

pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message)))
}

pub fn unauthorized(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::UNAUTHORIZED, Json(ErrorResponse::new(message)))
}

pub fn gateway_timeout(message: impl Into<String>) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::GATEWAY_TIMEOUT, Json(ErrorResponse::new(message)))
}

/// Logs the full error and returns a generic 500 to the client.
pub fn internal_error<E: std::fmt::Display>(context: &'static str) -> impl Fn(E) -> Response {
    move |err: E| {
        error!(context, error = %err, "internal error");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new("internal server error")),
        )
            .into_response()
    }
}
