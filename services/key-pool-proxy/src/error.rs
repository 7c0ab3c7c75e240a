//! Service-specific error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Proxy service errors.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized")]
    Unauthorized,
}

/// Result alias.
pub type Result<T> = std::result::Result<T, Error>;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match self {
            Error::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                axum::Json(json!({"detail": "Unauthorized"})),
            )
                .into_response(),
            Error::InvalidRequest(msg) => (
                StatusCode::BAD_REQUEST,
                axum::Json(json!({"error": {"message": msg}})),
            )
                .into_response(),
            Error::Upstream(_) | Error::Config(_) => (
                StatusCode::BAD_GATEWAY,
                axum::Json(json!({"error": {"message": "upstream request failed"}})),
            )
                .into_response(),
        }
    }
}
