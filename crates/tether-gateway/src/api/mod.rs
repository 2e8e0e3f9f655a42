//! Read API for the UI.
//!
//! All operations require a bearer identity and are fenced per tenant by
//! the authorization subsystem; callers never reach data in a tenant they
//! were not granted. Responses are JSON; failures use the
//! [`error::ApiError`] envelope and never leak internals.

pub mod error;
mod sessions;
mod tenants;

use axum::http::HeaderMap;
use axum::routing::{delete, get, post};
use axum::Router;

use tether_core::auth::Subject;
use tether_core::error::Error;

use crate::state::AppState;
use error::ApiError;

/// Routes for the read API.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/namespaces", get(tenants::list_tenants))
        .route("/v1/namespaces/{tenant}/sessions", get(sessions::list_sessions))
        .route("/v1/namespaces/{tenant}/sessions", post(sessions::create_session))
        .route("/v1/namespaces/{tenant}/sessions/{id}", get(sessions::get_session))
        .route(
            "/v1/namespaces/{tenant}/sessions/{id}",
            delete(sessions::delete_session),
        )
        .route(
            "/v1/namespaces/{tenant}/sessions/{id}/stop",
            post(sessions::stop_session),
        )
        .route(
            "/v1/namespaces/{tenant}/sessions/{id}/approve",
            post(sessions::approve_session),
        )
        .route(
            "/v1/namespaces/{tenant}/sessions/{id}/reject",
            post(sessions::reject_session),
        )
        .route(
            "/v1/namespaces/{tenant}/sessions/{id}/logs",
            get(sessions::get_logs),
        )
        .route(
            "/v1/namespaces/{tenant}/sessions/{id}/artifacts",
            get(sessions::list_artifacts),
        )
}

/// Resolves the caller identity from the `Authorization` header.
pub(crate) async fn require_subject(
    state: &AppState,
    headers: &HeaderMap,
    trace_id: &str,
) -> Result<Subject, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ApiError::from_core(
                Error::authn("MissingToken", "missing bearer token"),
                trace_id,
            )
        })?;
    state
        .token_verifier
        .verify(token)
        .await
        .map_err(|e| ApiError::from_core(e, trace_id))
}

/// Requires that the subject may perform `verb` on sessions in `tenant`.
/// Fails closed when the authorization subsystem is unreachable.
pub(crate) async fn require_permission(
    state: &AppState,
    subject: &Subject,
    verb: &str,
    tenant: &str,
    trace_id: &str,
) -> Result<(), ApiError> {
    let allowed = state
        .authorizer
        .allowed(subject, verb, "sessions", tenant)
        .await
        .map_err(|e| ApiError::from_core(e, trace_id))?;
    if allowed {
        return Ok(());
    }
    state.audit.record(
        tether_core::audit::AuditEntry::now(
            tenant,
            &subject.username,
            &format!("sessions.{verb}"),
            "Session",
            tether_core::audit::AuditOutcome::Deny,
            trace_id,
        )
        .detail("permission denied"),
    );
    Err(ApiError::from_core(
        Error::authz(
            "PermissionDenied",
            format!("not permitted to {verb} sessions in {tenant}"),
        ),
        trace_id,
    ))
}
