//! Read-API error envelope.
//!
//! User-visible failures carry `{code, reason, message, traceId}` and
//! never leak internal stack detail. The HTTP status derives from the
//! core error kind.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use tether_core::error::{Error, ErrorKind};

/// JSON error envelope returned by every gateway surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiError {
    /// HTTP status code, repeated in the body for log correlation.
    pub code: u16,
    /// Stable machine reason token.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
    /// Trace id of the failed request.
    pub trace_id: String,
}

impl ApiError {
    /// Wraps a core error with the request trace id.
    #[must_use]
    pub fn from_core(err: Error, trace_id: &str) -> Self {
        let status = status_for(err.kind());
        Self {
            code: status.as_u16(),
            reason: err.reason().to_string(),
            message: sanitized_message(&err),
            trace_id: trace_id.to_string(),
        }
    }

    /// A 404 for resources that must not be revealed further.
    #[must_use]
    pub fn not_found(trace_id: &str) -> Self {
        Self {
            code: StatusCode::NOT_FOUND.as_u16(),
            reason: "NotFound".to_string(),
            message: "resource not found".to_string(),
            trace_id: trace_id.to_string(),
        }
    }

    /// The HTTP status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

/// Maps an error kind to its HTTP status.
#[must_use]
pub const fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::AuthN => StatusCode::UNAUTHORIZED,
        ErrorKind::AuthZ | ErrorKind::PolicyViolation => StatusCode::FORBIDDEN,
        ErrorKind::ShapeInvalid => StatusCode::BAD_REQUEST,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Transient => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Internal faults keep their detail out of responses.
fn sanitized_message(err: &Error) -> String {
    if err.kind() == ErrorKind::Fatal {
        "internal error".to_string()
    } else {
        err.message().to_string()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self)).into_response()
    }
}
