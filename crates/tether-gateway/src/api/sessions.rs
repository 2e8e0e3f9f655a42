//! Session operations on the read API.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use base64::Engine;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use tether_core::error::Error;
use tether_core::resource::session::{ApprovalDecision, ArtifactRef, Phase, Session};
use tether_core::store::Stored;
use tether_core::workload::workload_name;

use super::error::ApiError;
use crate::state::AppState;
use crate::trace::trace_id_from;
use crate::webhook::factory::CreateSessionRequest;

/// Default page size for session listings.
const DEFAULT_PAGE_SIZE: usize = 50;
/// Maximum accepted page size.
const MAX_PAGE_SIZE: usize = 500;

/// Listing filters and pagination.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    /// Filter by phase.
    #[serde(default)]
    pub phase: Option<Phase>,
    /// Filter by framework type.
    #[serde(default)]
    pub framework: Option<String>,
    /// Substring match on id or trigger event.
    #[serde(default)]
    pub search: Option<String>,
    /// Opaque continuation token.
    #[serde(default)]
    pub page_token: Option<String>,
    /// Page size, clamped to the maximum.
    #[serde(default)]
    pub page_size: Option<usize>,
}

/// One page of sessions.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    /// The sessions on this page.
    pub sessions: Vec<Session>,
    /// Continuation token, present when more pages exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

fn encode_page_token(offset: usize) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(format!("offset:{offset}"))
}

fn decode_page_token(token: &str) -> Result<usize, Error> {
    base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(token)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .and_then(|s| s.strip_prefix("offset:").map(ToString::to_string))
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::shape("PageToken", "malformed page token"))
}

/// `GET /v1/namespaces/{tenant}/sessions`
pub async fn list_sessions(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    Query(query): Query<ListQuery>,
    headers: HeaderMap,
) -> Result<Json<SessionPage>, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "list", &tenant, &trace_id).await?;

    let offset = match &query.page_token {
        Some(token) => decode_page_token(token).map_err(|e| ApiError::from_core(e, &trace_id))?,
        None => 0,
    };
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

    let mut sessions: Vec<Session> = state
        .sessions
        .list(&tenant)
        .into_iter()
        .map(|s| s.resource)
        .filter(|s| query.phase.is_none_or(|phase| s.status.phase == phase))
        .filter(|s| {
            query
                .framework
                .as_deref()
                .is_none_or(|f| s.spec.framework.framework_type == f)
        })
        .filter(|s| {
            query.search.as_deref().is_none_or(|needle| {
                s.id.contains(needle) || s.spec.trigger.event.contains(needle)
            })
        })
        .collect();
    // Newest first; id breaks ties for a stable page order.
    sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

    let total = sessions.len();
    let page: Vec<Session> = sessions.into_iter().skip(offset).take(page_size).collect();
    let next_offset = offset + page.len();
    let next_page_token = (next_offset < total).then(|| encode_page_token(next_offset));

    state.metrics.metrics().api_request("sessions.list", 200);
    Ok(Json(SessionPage {
        sessions: page,
        next_page_token,
    }))
}

fn load_session(
    state: &AppState,
    tenant: &str,
    id: &str,
    trace_id: &str,
) -> Result<Stored<Session>, ApiError> {
    state
        .sessions
        .get(tenant, id)
        .ok_or_else(|| ApiError::not_found(trace_id))
}

/// `GET /v1/namespaces/{tenant}/sessions/{id}`
pub async fn get_session(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Session>, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "get", &tenant, &trace_id).await?;

    let stored = load_session(&state, &tenant, &id, &trace_id)?;
    state.metrics.metrics().api_request("sessions.get", 200);
    Ok(Json(stored.resource))
}

/// `POST /v1/namespaces/{tenant}/sessions` — editor only.
pub async fn create_session(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "create", &tenant, &trace_id).await?;

    let request: CreateSessionRequest = serde_json::from_slice(&body).map_err(|e| {
        ApiError::from_core(
            Error::shape("RequestNotJson", format!("invalid create request: {e}")),
            &trace_id,
        )
    })?;

    let policy = state.authenticator.tenant_policy(&tenant);
    let session = state
        .factory
        .from_request(&tenant, request, &policy, &trace_id);
    let session_id = session.id.clone();

    match state.sessions.create(session) {
        Ok(stored) => {
            state.audit.record(
                tether_core::audit::AuditEntry::now(
                    &tenant,
                    &subject.username,
                    "session.create",
                    "Session",
                    tether_core::audit::AuditOutcome::Allow,
                    &trace_id,
                )
                .session(&session_id),
            );
            state.outbox.publish(
                &tenant,
                tether_core::notify::NotificationEvent::SessionCreated,
                Some(&session_id),
                serde_json::json!({ "source": "manual" }),
            );
            state.metrics.metrics().api_request("sessions.create", 201);
            Ok((StatusCode::CREATED, Json(stored.resource)))
        }
        Err(e) => {
            state.metrics.metrics().admission_denied(e.kind().as_str(), e.reason());
            state.audit.record(
                tether_core::audit::AuditEntry::now(
                    &tenant,
                    &subject.username,
                    "session.create",
                    "Session",
                    tether_core::audit::AuditOutcome::Deny,
                    &trace_id,
                )
                .session(&session_id)
                .detail(e.to_string()),
            );
            Err(ApiError::from_core(e, &trace_id))
        }
    }
}

/// `POST /v1/namespaces/{tenant}/sessions/{id}/stop` — editor only.
///
/// Sets the cooperative stop flag; the session controller deletes the
/// workload and transitions the phase.
pub async fn stop_session(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "update", &tenant, &trace_id).await?;

    let stored = load_session(&state, &tenant, &id, &trace_id)?;
    if stored.resource.status.phase != Phase::Running {
        return Err(ApiError::from_core(
            Error::conflict(
                "NotRunning",
                format!(
                    "session is {}; only running sessions can be stopped",
                    stored.resource.status.phase
                ),
            ),
            &trace_id,
        ));
    }

    state
        .sessions
        .update_with(&tenant, &id, |s| {
            s.spec.stop_requested = true;
            Ok(())
        })
        .map_err(|e| ApiError::from_core(e, &trace_id))?;

    state.audit.record(
        tether_core::audit::AuditEntry::now(
            &tenant,
            &subject.username,
            "session.stop",
            "Session",
            tether_core::audit::AuditOutcome::Allow,
            &trace_id,
        )
        .session(&id),
    );
    state.metrics.metrics().api_request("sessions.stop", 204);
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /v1/namespaces/{tenant}/sessions/{id}/approve` — editor only.
///
/// Records the approval verdict on a gated session; the reconciler then
/// starts the workload. Emits `session.approved`.
pub async fn approve_session(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    decide_session(state, tenant, id, headers, ApprovalDecision::Approved).await
}

/// `POST /v1/namespaces/{tenant}/sessions/{id}/reject` — editor only.
///
/// Records the rejection verdict on a gated session; the reconciler fails
/// it without starting a workload. Emits `session.rejected`.
pub async fn reject_session(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    decide_session(state, tenant, id, headers, ApprovalDecision::Rejected).await
}

async fn decide_session(
    state: AppState,
    tenant: String,
    id: String,
    headers: HeaderMap,
    decision: ApprovalDecision,
) -> Result<StatusCode, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "update", &tenant, &trace_id).await?;

    let stored = load_session(&state, &tenant, &id, &trace_id)?;
    let session = &stored.resource;
    if !session.spec.policy.approval_required {
        return Err(ApiError::from_core(
            Error::conflict("NotGated", "session does not require approval"),
            &trace_id,
        ));
    }
    if session.status.phase != Phase::Pending {
        return Err(ApiError::from_core(
            Error::conflict(
                "NotPending",
                format!("session is {}; approval applies before execution", session.status.phase),
            ),
            &trace_id,
        ));
    }
    if session.spec.approval_decision.is_some() {
        return Err(ApiError::from_core(
            Error::conflict("AlreadyDecided", "an approval decision was already recorded"),
            &trace_id,
        ));
    }

    let (event_name, action, notification) = match decision {
        ApprovalDecision::Approved => (
            "ApprovalGranted",
            "session.approve",
            tether_core::notify::NotificationEvent::SessionApproved,
        ),
        ApprovalDecision::Rejected => (
            "ApprovalRejected",
            "session.reject",
            tether_core::notify::NotificationEvent::SessionRejected,
        ),
    };

    let mut recorded = false;
    state
        .sessions
        .update_with(&tenant, &id, |s| {
            recorded = false;
            if s.spec.approval_decision.is_some() || s.status.phase != Phase::Pending {
                return Ok(());
            }
            s.spec.approval_decision = Some(decision);
            s.status.append_history(
                event_name,
                serde_json::json!({ "decidedBy": subject.username }),
                Utc::now(),
            );
            recorded = true;
            Ok(())
        })
        .map_err(|e| ApiError::from_core(e, &trace_id))?;
    if !recorded {
        // A concurrent editor got there first.
        return Err(ApiError::from_core(
            Error::conflict("AlreadyDecided", "an approval decision was already recorded"),
            &trace_id,
        ));
    }

    state.audit.record(
        tether_core::audit::AuditEntry::now(
            &tenant,
            &subject.username,
            action,
            "Session",
            tether_core::audit::AuditOutcome::Allow,
            &trace_id,
        )
        .session(&id),
    );
    state.outbox.publish(
        &tenant,
        notification,
        Some(&id),
        serde_json::json!({ "decidedBy": subject.username }),
    );
    state.metrics.metrics().api_request(action, 204);
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/namespaces/{tenant}/sessions/{id}` — editor only.
pub async fn delete_session(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "delete", &tenant, &trace_id).await?;

    state
        .sessions
        .delete(&tenant, &id)
        .map_err(|_| ApiError::not_found(&trace_id))?;

    // The session owns its workload: reap it with the session, along with
    // gateway-side residue (callback token, pushed logs).
    if let Err(e) = state.orchestrator.delete(&tenant, &workload_name(&id)).await {
        tracing::warn!(tenant = %tenant, session = %id, error = %e, "workload reap on delete failed");
    }
    state.callback_tokens.revoke(&id);
    state.logs.remove(&tenant, &id);

    state.audit.record(
        tether_core::audit::AuditEntry::now(
            &tenant,
            &subject.username,
            "session.delete",
            "Session",
            tether_core::audit::AuditOutcome::Allow,
            &trace_id,
        )
        .session(&id),
    );
    state.metrics.metrics().api_request("sessions.delete", 204);
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /v1/namespaces/{tenant}/sessions/{id}/logs`
///
/// Serves runner-pushed log lines, falling back to orchestrator log
/// capture when the runner has not pushed any.
pub async fn get_logs(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<String, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "get", &tenant, &trace_id).await?;

    load_session(&state, &tenant, &id, &trace_id)?;

    let mut lines = state.logs.get(&tenant, &id);
    if lines.is_empty() {
        lines = state
            .orchestrator
            .logs(&tenant, &workload_name(&id))
            .await
            .unwrap_or_default();
    }
    state.metrics.metrics().api_request("sessions.logs", 200);
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok(body)
}

/// `GET /v1/namespaces/{tenant}/sessions/{id}/artifacts`
pub async fn list_artifacts(
    State(state): State<AppState>,
    Path((tenant, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Vec<ArtifactRef>>, ApiError> {
    let trace_id = trace_id_from(&headers);
    let subject = super::require_subject(&state, &headers, &trace_id).await?;
    super::require_permission(&state, &subject, "get", &tenant, &trace_id).await?;

    let stored = load_session(&state, &tenant, &id, &trace_id)?;
    state.metrics.metrics().api_request("sessions.artifacts", 200);
    Ok(Json(stored.resource.status.artifacts))
}
