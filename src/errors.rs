//! Error taxonomy for the API surface.
//!
//! The wire contract is in-band: failures ride an HTTP 200 response carrying
//! an `{"error": "..."}` body, which existing clients string-match on. That
//! contract lives entirely in the `IntoResponse` impl here; handlers work
//! with `Result<_, ApiError>` and never inspect message strings.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Email already exists")]
    EmailTaken,

    #[error("Invalid email/password")]
    BadCredentials,

    #[error("Failed to compute analytics")]
    AnalyticsFailed,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn internal(err: impl std::fmt::Display) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (StatusCode::OK, Json(body)).into_response()
    }
}
