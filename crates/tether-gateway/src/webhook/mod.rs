//! Webhook ingestion pipeline.
//!
//! `POST /webhooks/{source}` runs, in order: source lookup, credential
//! authentication with server-side tenant resolution, per-tenant rate
//! limiting, payload normalization, session construction, and synchronous
//! admission through the store. Every allow and deny writes an audit
//! entry carrying the request trace id.
//!
//! A 100 KiB body limit bounds memory; rate limiting runs after
//! authentication because the limit is per-tenant, and the tenant is only
//! known once a credential verifies.

pub mod auth;
pub mod factory;
pub mod normalize;
pub mod rate_limit;

use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use tether_core::audit::{AuditEntry, AuditOutcome};
use tether_core::error::Error;

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::trace::trace_id_from;

/// Maximum accepted webhook body, in bytes.
const MAX_BODY_SIZE: usize = 100 * 1024;

/// Rough scheduling latency promised to webhook callers.
const ESTIMATED_START_SECS: i64 = 30;

/// Accepted-webhook response body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAccepted {
    /// Id of the created session.
    pub session_id: String,
    /// Tenant the session landed in (resolved server-side).
    pub tenant: String,
    /// Always `accepted`.
    pub status: &'static str,
    /// Best-effort estimate of when the runner starts.
    pub estimated_start_time: chrono::DateTime<Utc>,
}

/// Routes for webhook ingestion.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/webhooks/{source}", post(webhook_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
}

async fn webhook_handler(
    State(state): State<AppState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookAccepted>), ApiError> {
    let trace_id = trace_id_from(&headers);
    tracing::info!(source = %source, trace_id = %trace_id, body_size = body.len(), "webhook received");

    if !state.authenticator.known_source(&source) {
        state.metrics.metrics().webhook_request(&source, "unknown-source");
        return Err(ApiError::from_core(
            Error::not_found("UnknownSource", format!("webhook source {source:?} is not registered")),
            &trace_id,
        ));
    }

    // Authenticate; the verified credential is the tenant resolution.
    let tenant = match state.authenticator.authenticate(&source, &headers, &body).await {
        Ok(tenant) => tenant,
        Err(e) => {
            state.metrics.metrics().webhook_request(&source, "unauthenticated");
            // Unauthenticated requests have no tenant; audit under the
            // source pseudo-tenant so denials remain visible.
            state.audit.record(
                AuditEntry::now(
                    "unresolved",
                    &format!("webhook:{source}"),
                    "webhook.receive",
                    "Session",
                    AuditOutcome::Deny,
                    &trace_id,
                )
                .detail(e.to_string()),
            );
            return Err(ApiError::from_core(e, &trace_id));
        }
    };

    let policy = state.authenticator.tenant_policy(&tenant);
    if let Err(e) = state
        .limiter
        .check(&tenant, &source, &policy.spec.webhook_auth.rate_limit)
    {
        state.metrics.metrics().webhook_request(&source, "rate-limited");
        state.audit.record(
            AuditEntry::now(
                &tenant,
                &format!("webhook:{source}"),
                "webhook.receive",
                "Session",
                AuditOutcome::Deny,
                &trace_id,
            )
            .detail(e.to_string()),
        );
        return Err(ApiError::from_core(e, &trace_id));
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            state.metrics.metrics().webhook_request(&source, "malformed");
            return Err(ApiError::from_core(
                Error::shape("PayloadNotJson", format!("request body is not JSON: {e}")),
                &trace_id,
            ));
        }
    };

    let header_event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok());
    let event = normalize::normalize_event(&source, header_event, &payload);

    let session = state
        .factory
        .from_webhook(&tenant, &source, &event, payload, &policy, &trace_id);
    let session_id = session.id.clone();

    // Synchronous admission inside the store write.
    let admission_started = Instant::now();
    let created = state.sessions.create(session);
    state
        .metrics
        .metrics()
        .observe_admission_latency(admission_started.elapsed().as_secs_f64());

    match created {
        Ok(_) => {}
        Err(e) => {
            state.metrics.metrics().webhook_request(&source, "rejected");
            state.metrics.metrics().admission_denied(e.kind().as_str(), e.reason());
            state.audit.record(
                AuditEntry::now(
                    &tenant,
                    &format!("webhook:{source}"),
                    "session.create",
                    "Session",
                    AuditOutcome::Deny,
                    &trace_id,
                )
                .session(&session_id)
                .detail(e.to_string()),
            );
            return Err(ApiError::from_core(e, &trace_id));
        }
    }

    state.metrics.metrics().webhook_request(&source, "accepted");
    state.metrics.metrics().session_created(&source);
    state.audit.record(
        AuditEntry::now(
            &tenant,
            &format!("webhook:{source}"),
            "session.create",
            "Session",
            AuditOutcome::Allow,
            &trace_id,
        )
        .session(&session_id)
        .detail(format!("event {event}")),
    );
    state.outbox.publish(
        &tenant,
        tether_core::notify::NotificationEvent::SessionCreated,
        Some(&session_id),
        serde_json::json!({ "source": source, "event": event }),
    );

    tracing::info!(
        tenant = %tenant,
        session = %session_id,
        event = %event,
        trace_id = %trace_id,
        "webhook accepted"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookAccepted {
            session_id,
            tenant,
            status: "accepted",
            estimated_start_time: Utc::now() + chrono::Duration::seconds(ESTIMATED_START_SECS),
        }),
    ))
}
