//! Runner callback surface.
//!
//! Runners authenticate with a per-session bearer token minted when their
//! workload is built. Only a SHA-256 verifier of the token is retained;
//! presentation is checked with a constant-time comparison and the
//! session binding is enforced — a token for one session cannot touch
//! another, regardless of the URL it is presented on.
//!
//! Through this surface runners may: report status/progress (history
//! appends), push log chunks, register artifact references, and report
//! final resource usage. History prefix mutation is impossible here by
//! construction (appends only) and is additionally rejected by admission.

use std::collections::HashMap;
use std::sync::RwLock;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use tether_core::error::{Error, Result};
use tether_core::resource::session::{ArtifactRef, ResourceUsage};
use tether_core::workload::CallbackTokenIssuer;

use crate::api::error::ApiError;
use crate::state::AppState;
use crate::trace::trace_id_from;

/// Cap on stored log lines per session; oldest lines are dropped first.
const MAX_LOG_LINES_PER_SESSION: usize = 10_000;

/// Issues and verifies per-session callback tokens.
#[derive(Default)]
pub struct CallbackTokenRegistry {
    // session id -> (tenant, sha256 verifier of the token)
    verifiers: RwLock<HashMap<String, (String, [u8; 32])>>,
}

impl CallbackTokenRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies a presented token against a session binding, returning
    /// the bound tenant.
    ///
    /// # Errors
    ///
    /// `AuthN` when the session has no token or the token does not match.
    pub fn verify(&self, session_id: &str, token: &str) -> Result<String> {
        let verifiers = self
            .verifiers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let (tenant, verifier) = verifiers
            .get(session_id)
            .ok_or_else(|| Error::authn("UnknownSession", "no callback token for this session"))?;
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        if !bool::from(presented.ct_eq(verifier)) {
            return Err(Error::authn("InvalidToken", "callback token does not match"));
        }
        Ok(tenant.clone())
    }

    /// Drops a session's token, e.g. after retention sweep.
    pub fn revoke(&self, session_id: &str) {
        self.verifiers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(session_id);
    }
}

impl CallbackTokenIssuer for CallbackTokenRegistry {
    fn issue(&self, tenant: &str, session_id: &str) -> SecretString {
        let mut raw = [0u8; 32];
        rand::rng().fill_bytes(&mut raw);
        let token = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw);
        let verifier: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        self.verifiers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(session_id.to_string(), (tenant.to_string(), verifier));
        SecretString::from(token)
    }
}

/// In-memory per-session log storage fed by runner callbacks.
#[derive(Default)]
pub struct SessionLogStore {
    lines: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl SessionLogStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends lines for a session, trimming to the per-session cap.
    pub fn append(&self, tenant: &str, session_id: &str, new_lines: Vec<String>) {
        let mut lines = self
            .lines
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let entry = lines
            .entry((tenant.to_string(), session_id.to_string()))
            .or_default();
        entry.extend(new_lines);
        if entry.len() > MAX_LOG_LINES_PER_SESSION {
            let excess = entry.len() - MAX_LOG_LINES_PER_SESSION;
            entry.drain(..excess);
        }
    }

    /// Snapshot of a session's stored lines.
    #[must_use]
    pub fn get(&self, tenant: &str, session_id: &str) -> Vec<String> {
        self.lines
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(tenant.to_string(), session_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Drops a session's lines.
    pub fn remove(&self, tenant: &str, session_id: &str) {
        self.lines
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&(tenant.to_string(), session_id.to_string()));
    }
}

/// Routes for the runner callback surface.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/callbacks/sessions/{id}/status", post(post_status))
        .route("/v1/callbacks/sessions/{id}/logs", post(post_logs))
        .route("/v1/callbacks/sessions/{id}/artifacts", post(post_artifacts))
}

fn authenticate_runner(
    state: &AppState,
    session_id: &str,
    headers: &HeaderMap,
    trace_id: &str,
) -> std::result::Result<String, ApiError> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| {
            ApiError::from_core(
                Error::authn("MissingToken", "missing bearer callback token"),
                trace_id,
            )
        })?;
    state
        .callback_tokens
        .verify(session_id, token)
        .map_err(|e| ApiError::from_core(e, trace_id))
}

/// Status/progress report from a runner.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusUpdate {
    /// Event name recorded in history, e.g. `RunnerProgress`.
    event: String,
    /// Opaque event detail.
    #[serde(default)]
    data: Value,
    /// Final usage counters, when the runner is wrapping up.
    #[serde(default)]
    resource_usage: Option<ResourceUsage>,
}

async fn post_status(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(update): Json<StatusUpdate>,
) -> std::result::Result<axum::http::StatusCode, ApiError> {
    let trace_id = trace_id_from(&headers);
    let tenant = authenticate_runner(&state, &session_id, &headers, &trace_id)?;

    state
        .sessions
        .update_with(&tenant, &session_id, |s| {
            s.status
                .append_history(update.event.clone(), update.data.clone(), Utc::now());
            if let Some(usage) = update.resource_usage.clone() {
                s.status.resource_usage = Some(usage);
            }
            Ok(())
        })
        .map_err(|e| ApiError::from_core(e, &trace_id))?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Log chunk pushed by a runner.
#[derive(Debug, Deserialize)]
struct LogChunk {
    lines: Vec<String>,
}

async fn post_logs(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(chunk): Json<LogChunk>,
) -> std::result::Result<axum::http::StatusCode, ApiError> {
    let trace_id = trace_id_from(&headers);
    let tenant = authenticate_runner(&state, &session_id, &headers, &trace_id)?;
    state.logs.append(&tenant, &session_id, chunk.lines);
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Artifact reference registration.
#[derive(Debug, Deserialize)]
struct ArtifactReport {
    artifacts: Vec<ArtifactRef>,
}

async fn post_artifacts(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    headers: HeaderMap,
    Json(report): Json<ArtifactReport>,
) -> std::result::Result<axum::http::StatusCode, ApiError> {
    let trace_id = trace_id_from(&headers);
    let tenant = authenticate_runner(&state, &session_id, &headers, &trace_id)?;

    state
        .sessions
        .update_with(&tenant, &session_id, |s| {
            for artifact in &report.artifacts {
                // Re-registration by name replaces the reference.
                s.status.artifacts.retain(|a| a.name != artifact.name);
                s.status.artifacts.push(artifact.clone());
            }
            s.status.append_history(
                "ArtifactsReported",
                json!({ "names": report.artifacts.iter().map(|a| &a.name).collect::<Vec<_>>() }),
                Utc::now(),
            );
            Ok(())
        })
        .map_err(|e| ApiError::from_core(e, &trace_id))?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}
