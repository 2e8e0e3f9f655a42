//! Workload orchestration.
//!
//! The reconciler turns a Session into one batch-style workload on the
//! orchestrator: runner image from the framework registry, environment
//! carrying the session identity and callback binding, hardened security
//! context, an active deadline, and an owner reference back to the
//! session so the workload is reaped with it.
//!
//! The orchestrator itself is external; [`WorkloadApi`] is the interface
//! the core consumes and [`fake::FakeOrchestrator`] the in-process stand-in
//! used by tests.

pub mod fake;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::framework::{FrameworkEntry, ParsedFrameworkConfig, ResourceProfile};
use crate::resource::session::{Session, WorkloadRef};

/// Suffix appended to the session id to derive the workload name.
pub const WORKLOAD_NAME_SUFFIX: &str = "-runner";

/// Derives the workload name for a session id.
#[must_use]
pub fn workload_name(session_id: &str) -> String {
    format!("{session_id}{WORKLOAD_NAME_SUFFIX}")
}

/// One environment variable, literal or secret-referenced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Literal value; mutually exclusive with `secret_ref`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Secret-store reference resolved by the orchestrator at start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<String>,
}

impl EnvVar {
    /// A literal variable.
    #[must_use]
    pub fn literal(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: Some(value.into()),
            secret_ref: None,
        }
    }

    /// A secret-referenced variable.
    #[must_use]
    pub fn secret(name: &str, reference: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            secret_ref: Some(reference.into()),
        }
    }
}

/// Container security hardening applied to every runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityContext {
    /// Run as a non-root user.
    pub run_as_non_root: bool,
    /// Drop all capabilities.
    pub drop_all_capabilities: bool,
    /// Mount the root filesystem read-only.
    pub read_only_rootfs: bool,
}

impl SecurityContext {
    /// The hardened default: non-root, cap-drop-all, rootfs per framework.
    #[must_use]
    pub const fn hardened(read_only_rootfs: bool) -> Self {
        Self {
            run_as_non_root: true,
            drop_all_capabilities: true,
            read_only_rootfs,
        }
    }
}

/// Owner reference tying a workload to its session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    /// Owning session id.
    pub session_id: String,
    /// Owning tenant.
    pub tenant: String,
}

/// Desired workload, submitted to the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Workload name, derived from the session id.
    pub name: String,
    /// Target namespace (the tenant).
    pub tenant: String,
    /// Full image reference.
    pub image: String,
    /// Runner environment.
    pub env: Vec<EnvVar>,
    /// Resource requests and limits.
    pub resources: ResourceProfile,
    /// Security hardening.
    pub security: SecurityContext,
    /// Wall-clock deadline enforced by the orchestrator.
    #[serde(with = "duration_secs")]
    pub active_deadline: Duration,
    /// Retry budget; always zero, retries are a session-level concern.
    pub backoff_limit: u32,
    /// How long the finished workload lingers for log retrieval.
    #[serde(with = "duration_secs")]
    pub ttl_after_finished: Duration,
    /// Owner reference for cascade delete.
    pub owner: OwnerRef,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Observed workload execution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum WorkloadState {
    /// Accepted, not yet scheduled.
    Pending,
    /// Container running.
    Running,
    /// Exited zero.
    Succeeded,
    /// Exited non-zero or was evicted.
    Failed {
        /// Container exit code, when known.
        exit_code: Option<i32>,
        /// Orchestrator-reported reason.
        reason: String,
    },
}

/// Observed workload status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// Handle of the workload.
    pub workload_ref: WorkloadRef,
    /// Execution state.
    pub state: WorkloadState,
    /// When the container started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the container finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// The orchestrator surface the core consumes.
#[async_trait]
pub trait WorkloadApi: Send + Sync {
    /// Creates the workload, or adopts an existing one with the same name
    /// and owner (idempotent by name).
    ///
    /// # Errors
    ///
    /// `Conflict` with reason `WorkloadNameConflict` when the name exists
    /// under a different owner; `Transient` on orchestrator I/O failure.
    async fn create(&self, spec: &WorkloadSpec) -> Result<WorkloadRef>;

    /// Fetches workload status; `None` when the workload does not exist.
    ///
    /// # Errors
    ///
    /// `Transient` on orchestrator I/O failure.
    async fn status(&self, tenant: &str, name: &str) -> Result<Option<WorkloadStatus>>;

    /// Deletes the workload. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// `Transient` on orchestrator I/O failure.
    async fn delete(&self, tenant: &str, name: &str) -> Result<bool>;

    /// Streams the workload's log lines (already-captured portion).
    ///
    /// # Errors
    ///
    /// `NotFound` when the workload is gone; `Transient` on I/O failure.
    async fn logs(&self, tenant: &str, name: &str) -> Result<Vec<String>>;
}

/// Issues per-session callback tokens for runner -> control-plane auth.
///
/// Implementations persist only a one-way verifier; the token itself goes
/// into the runner environment and nowhere else.
pub trait CallbackTokenIssuer: Send + Sync {
    /// Mints a token bound to `(tenant, session_id)`.
    fn issue(&self, tenant: &str, session_id: &str) -> SecretString;
}

/// Inputs the reconciler needs beyond the session itself to build a
/// workload spec.
pub struct RunnerBinding<'a> {
    /// Base URL runners call back on, e.g. `https://gateway.internal`.
    pub callback_base_url: &'a str,
    /// Freshly issued callback token.
    pub callback_token: &'a SecretString,
    /// Trace id propagated from the triggering request.
    pub trace_id: &'a str,
}

/// Builds the workload spec for a session.
///
/// The policy snapshot rides along redacted to its constraint lists; the
/// runner sees what it may use, never any credential material (credentials
/// are secret references resolved by the orchestrator).
#[must_use]
pub fn build_workload_spec(
    session: &Session,
    entry: &FrameworkEntry,
    config: &ParsedFrameworkConfig,
    binding: &RunnerBinding<'_>,
) -> WorkloadSpec {
    let mut env = vec![
        EnvVar::literal("SESSION_ID", &session.id),
        EnvVar::literal("SESSION_TENANT", &session.tenant),
        EnvVar::literal(
            "CALLBACK_URL",
            format!(
                "{}/v1/callbacks/sessions/{}",
                binding.callback_base_url.trim_end_matches('/'),
                session.id
            ),
        ),
        EnvVar::literal("CALLBACK_TOKEN", binding.callback_token.expose_secret()),
        EnvVar::literal("TRACE_ID", binding.trace_id),
        EnvVar::literal(
            "SESSION_POLICY",
            serde_json::to_string(&session.spec.policy).unwrap_or_default(),
        ),
        EnvVar::secret(
            "RUNNER_API_KEY",
            format!("tenants/{}/runner-credentials", session.tenant),
        ),
    ];
    if let Some(model) = &config.model {
        env.push(EnvVar::literal("MODEL", model));
    }
    if let Some(max_turns) = config.max_turns {
        env.push(EnvVar::literal("MAX_TURNS", max_turns.to_string()));
    }

    WorkloadSpec {
        name: workload_name(&session.id),
        tenant: session.tenant.clone(),
        image: entry.image_for(&session.spec.framework.version),
        env,
        resources: entry.resources.clone(),
        security: SecurityContext::hardened(!entry.writable_rootfs),
        active_deadline: crate::framework::FrameworkRegistry::effective_timeout(entry, config),
        backoff_limit: 0,
        ttl_after_finished: Duration::from_secs(entry.ttl_after_finished_secs),
        owner: OwnerRef {
            session_id: session.id.clone(),
            tenant: session.tenant.clone(),
        },
    }
}
