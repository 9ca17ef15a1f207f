//! Centralized error types for the WaveCast core library.
//!
//! Two families live here:
//! - [`CastError`]: HTTP-surface errors, mapped to status codes and rendered
//!   as JSON bodies via `IntoResponse`.
//! - [`SignalCode`]: protocol-level error codes carried inside signaling
//!   `{type:"error"}` frames. These are data, not Rust errors; the connection
//!   stays open after sending one.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type for the HTTP surface.
#[derive(Debug, Error)]
pub enum CastError {
    /// Requested room does not exist.
    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// Client sent an invalid or malformed request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Missing or invalid session cookie.
    #[error("Authentication required")]
    AuthRequired,

    /// TLS is enforced and the request arrived over plain HTTP.
    #[error("TLS required")]
    TlsRequired,

    /// Per-IP rate limit exceeded.
    #[error("Too many requests")]
    RateLimited,

    /// Server configuration error (missing required settings).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CastError {
    /// Returns a machine-readable error code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "room_not_found",
            Self::InvalidRequest(_) => "invalid_request",
            Self::AuthRequired => "auth_required",
            Self::TlsRequired => "tls_required",
            Self::RateLimited => "rate_limited",
            Self::Configuration(_) => "configuration_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::RoomNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::AuthRequired => StatusCode::UNAUTHORIZED,
            Self::TlsRequired => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Configuration(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for handler-level operations.
pub type CastResult<T> = Result<T, CastError>;

/// JSON response body for error responses.
#[derive(Serialize)]
struct ErrorResponse {
    error: &'static str,
    message: String,
    status: u16,
}

impl IntoResponse for CastError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.code(),
            message: self.to_string(),
            status: status.as_u16(),
        };
        (status, Json(body)).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Signaling error codes
// ─────────────────────────────────────────────────────────────────────────────

/// Error codes carried in signaling `{type:"error", code, message}` frames.
///
/// Sending one of these never closes the connection; the client decides how
/// to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalCode {
    AuthRequired,
    RoomNotFound,
    RoomFull,
    BroadcasterOccupied,
    InvalidRole,
    InvalidSlug,
    SlugInUse,
    MissingParams,
}

impl SignalCode {
    /// Human-readable companion message for the error frame.
    pub fn message(&self) -> &'static str {
        match self {
            Self::AuthRequired => "authentication required",
            Self::RoomNotFound => "room not found",
            Self::RoomFull => "room is full",
            Self::BroadcasterOccupied => "room already has a live broadcaster",
            Self::InvalidRole => "unknown role",
            Self::InvalidSlug => "invalid room id",
            Self::SlugInUse => "room id is currently live",
            Self::MissingParams => "missing parameters",
        }
    }
}
