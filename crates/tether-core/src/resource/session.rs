//! The Session resource.
//!
//! A Session is the tenant-scoped declarative record of one agentic
//! execution: an immutable trigger and framework selection, a policy
//! snapshot taken at admission, and a status block that only ever grows —
//! `status.history` is append-only and the phase walks a fixed DAG with no
//! exit from terminal states.
//!
//! Status helpers here are the single place phase transitions happen, so
//! the invariant "every phase change appends exactly one history entry"
//! holds by construction for all writers that go through them.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::resource::budget::BudgetAmount;

/// Condition type names used on Sessions and NamespacePolicies.
pub mod condition_types {
    /// The session spec satisfied the tenant policy at validation time.
    pub const POLICY_VALIDATED: &str = "PolicyValidated";
    /// The runner workload exists.
    pub const WORKLOAD_CREATED: &str = "WorkloadCreated";
    /// The runner workload is executing.
    pub const WORKLOAD_RUNNING: &str = "WorkloadRunning";
    /// The runner reported its artifacts before finishing.
    pub const ARTIFACTS_STORED: &str = "ArtifactsStored";
    /// An approval-gated session has been approved (or is still waiting).
    pub const APPROVAL_GRANTED: &str = "ApprovalGranted";
    /// The policy document is well-formed.
    pub const CONFIG_VALID: &str = "ConfigValid";
    /// Sessions in the tenant violate the current policy.
    pub const POLICY_VIOLATION: &str = "PolicyViolation";
}

/// Lifecycle phase of a Session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Admitted, not yet running.
    Pending,
    /// Workload created and executing.
    Running,
    /// Workload finished successfully. Terminal.
    Completed,
    /// Validation, policy, or workload failure. Terminal.
    Failed,
    /// Stopped on request. Terminal.
    Stopped,
    /// Overall deadline exceeded. Terminal.
    TimedOut,
}

impl Phase {
    /// Whether this phase admits no further transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped | Self::TimedOut)
    }

    /// Whether the session counts against the active-session cap.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Whether the edge `self -> next` is on the lifecycle DAG.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed),
            Self::Running => matches!(
                next,
                Self::Completed | Self::Failed | Self::Stopped | Self::TimedOut
            ),
            Self::Completed | Self::Failed | Self::Stopped | Self::TimedOut => false,
        }
    }

    /// The phase name as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Stopped => "Stopped",
            Self::TimedOut => "TimedOut",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Truth value of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// The condition holds.
    True,
    /// The condition does not hold.
    False,
    /// The controller cannot determine the condition.
    Unknown,
}

/// One observed condition, merged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, one of [`condition_types`].
    #[serde(rename = "type")]
    pub condition_type: String,
    /// Current truth value.
    pub status: ConditionStatus,
    /// When `status` last changed value.
    pub last_transition_time: DateTime<Utc>,
    /// Machine-readable reason token.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
}

/// One append-only history entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Commit time of the originating transition.
    pub timestamp: DateTime<Utc>,
    /// Event name, e.g. `PhaseChanged:Running` or `WorkloadCreated`.
    pub event: String,
    /// Opaque event payload.
    #[serde(default)]
    pub data: Value,
}

/// Reference to an artifact written by the runner. Content lives in the
/// artifact backend; the control plane stores only this reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    /// Artifact name, unique within the session.
    pub name: String,
    /// Artifact kind as reported by the runner (`diff`, `log`, `report`, ...).
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// Backend-specific location.
    pub location: String,
    /// Payload size.
    pub size_bytes: u64,
    /// Backend checksum, `sha256:<hex>`.
    pub checksum: String,
    /// When the runner registered the artifact.
    pub created_at: DateTime<Utc>,
}

/// Opaque handle of the runner workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadRef {
    /// Workload name, derived from the session id.
    pub name: String,
    /// Orchestrator-assigned UID.
    pub uid: String,
}

/// Rolled-up usage counters reported by the runner.
///
/// Unknown counters are retained verbatim but never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Runner-reported spend in cents; the unit of budget accounting.
    #[serde(default)]
    pub cost_cents: u64,
    /// Model input tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Model output tokens produced.
    #[serde(default)]
    pub output_tokens: u64,
    /// Tool invocations made by the agent.
    #[serde(default)]
    pub tool_calls: u64,
    /// Counters this control-plane version does not know about.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// What fired the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    /// Webhook source id, or `manual` for operator-created sessions.
    pub source: String,
    /// Normalized event type, e.g. `pull_request_opened`.
    pub event: String,
    /// Raw source payload, retained verbatim.
    #[serde(default)]
    pub payload: Value,
}

/// Which runner executes the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameworkSpec {
    /// Registered runner kind.
    #[serde(rename = "type")]
    pub framework_type: String,
    /// Runner version tag.
    pub version: String,
    /// Framework-specific configuration, parsed through the per-framework
    /// schema at workload build time.
    #[serde(default)]
    pub config: Value,
}

/// Model constraints snapshotted from the tenant policy at admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConstraints {
    /// Models the session may use.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Spend ceiling for this session.
    #[serde(default)]
    pub budget: BudgetAmount,
}

/// Tool constraints snapshotted from the tenant policy at admission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolConstraints {
    /// Tools the session may use.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Tools the session must not use.
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// Snapshot of the effective tenant constraints at admission time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySnapshot {
    /// Model allow-list and budget.
    #[serde(default)]
    pub model_constraints: ModelConstraints,
    /// Tool allow/block lists.
    #[serde(default)]
    pub tool_constraints: ToolConstraints,
    /// Whether a human approval gate applies before execution.
    #[serde(default)]
    pub approval_required: bool,
}

/// Where the runner writes artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactStorage {
    /// Backend kind.
    pub backend: ArtifactBackend,
    /// Backend-specific location prefix.
    pub location: String,
}

/// Supported artifact backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArtifactBackend {
    /// Object store bucket/prefix.
    ObjectStore,
    /// Mounted block volume path.
    BlockVolume,
    /// External URL the runner uploads to.
    ExternalUrl,
}

/// Operator verdict on an approval-gated session. Sticky once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    /// The session may proceed to execution.
    Approved,
    /// The session must not run; the reconciler fails it.
    Rejected,
}

/// Desired state of a session. Fields other than `policy`,
/// `artifact_storage`, `stop_requested`, and `approval_decision` are
/// immutable after admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSpec {
    /// What fired the session. Immutable.
    pub trigger: Trigger,
    /// Which runner executes it. Immutable.
    pub framework: FrameworkSpec,
    /// Constraint snapshot taken at admission.
    #[serde(default)]
    pub policy: PolicySnapshot,
    /// Where the runner writes artifacts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_storage: Option<ArtifactStorage>,
    /// Cooperative stop intent; the reconciler transitions to Stopped.
    #[serde(default)]
    pub stop_requested: bool,
    /// Verdict on an approval-gated session. While `policy.approvalRequired`
    /// holds and this is unset, the session waits in Pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_decision: Option<ApprovalDecision>,
}

/// Observed state of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Current lifecycle phase.
    #[serde(default = "default_phase")]
    pub phase: Phase,
    /// Observed conditions, merged by type.
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Append-only event history.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Artifact references registered by the runner.
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    /// Handle of the runner workload, once created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<WorkloadRef>,
    /// When the workload started.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    /// When the session reached a terminal phase.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,
    /// Rolled-up counters reported by the runner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_usage: Option<ResourceUsage>,
}

const fn default_phase() -> Phase {
    Phase::Pending
}

impl Default for Phase {
    fn default() -> Self {
        Self::Pending
    }
}

/// A tenant-scoped Session resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Unique within the tenant. Immutable.
    pub id: String,
    /// Owning tenant; maps to one orchestrator namespace. Immutable.
    pub tenant: String,
    /// Desired state.
    pub spec: SessionSpec,
    /// Observed state.
    #[serde(default)]
    pub status: SessionStatus,
    /// Trace id of the request that created the session; propagated into
    /// audit entries and the runner environment.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub trace_id: String,
    /// Creation timestamp, set by the store.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl SessionStatus {
    /// Moves the session to `next`, appending exactly one
    /// `PhaseChanged:<phase>` history entry.
    ///
    /// # Errors
    ///
    /// Returns `Fatal` with reason `InvalidTransition` when the edge is not
    /// on the lifecycle DAG (terminal phases are sticky).
    pub fn transition_to(
        &mut self,
        next: Phase,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::fatal(
                "InvalidTransition",
                format!("phase transition {} -> {next} is not allowed", self.phase),
            ));
        }
        self.phase = next;
        if next.is_terminal() {
            self.completion_time = Some(now);
        }
        self.append_history(
            format!("PhaseChanged:{next}"),
            serde_json::json!({ "reason": reason, "message": message }),
            now,
        );
        Ok(())
    }

    /// Appends one history entry. History never shrinks and existing
    /// entries are never touched.
    pub fn append_history(&mut self, event: impl Into<String>, data: Value, now: DateTime<Utc>) {
        self.history.push(HistoryEntry {
            timestamp: now,
            event: event.into(),
            data,
        });
    }

    /// Sets a condition, merging by type. `last_transition_time` only
    /// advances when the status value actually changes.
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        upsert_condition(&mut self.conditions, condition_type, status, reason, message, now);
    }

    /// Looks up a condition by type.
    #[must_use]
    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }
}

impl Session {
    /// Names of immutable spec fields that differ between `self` and `new`.
    ///
    /// Used by the admission validator to reject updates that touch
    /// immutable fields.
    #[must_use]
    pub fn changed_immutable_fields(&self, new: &Self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.id != new.id {
            changed.push("id");
        }
        if self.tenant != new.tenant {
            changed.push("tenant");
        }
        if self.spec.trigger != new.spec.trigger {
            changed.push("spec.trigger");
        }
        if self.spec.framework != new.spec.framework {
            changed.push("spec.framework");
        }
        changed
    }
}

/// Merges a condition into a condition list by type.
///
/// `last_transition_time` only advances when the status value actually
/// changes; reason and message always refresh.
pub fn upsert_condition(
    conditions: &mut Vec<Condition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.condition_type == condition_type)
    {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status;
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        return;
    }
    conditions.push(Condition {
        condition_type: condition_type.to_string(),
        status,
        last_transition_time: now,
        reason: reason.to_string(),
        message: message.to_string(),
    });
}

/// Whether a string is usable as a session id or tenant name: a DNS label,
/// lowercase alphanumerics and `-`, at most 63 characters, not starting or
/// ending with `-`.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn status_in(phase: Phase) -> SessionStatus {
        SessionStatus {
            phase,
            ..SessionStatus::default()
        }
    }

    #[test]
    fn phase_dag_edges() {
        use Phase::{Completed, Failed, Pending, Running, Stopped, TimedOut};

        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Stopped));

        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(TimedOut));
        assert!(!Running.can_transition_to(Pending));

        for terminal in [Completed, Failed, Stopped, TimedOut] {
            for next in [Pending, Running, Completed, Failed, Stopped, TimedOut] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn transition_appends_exactly_one_history_entry() {
        let mut status = status_in(Phase::Pending);
        let now = Utc::now();
        status.transition_to(Phase::Running, "WorkloadCreated", "ok", now).unwrap();

        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].event, "PhaseChanged:Running");
        assert_eq!(status.phase, Phase::Running);
        assert!(status.completion_time.is_none());
    }

    #[test]
    fn terminal_transition_sets_completion_time() {
        let mut status = status_in(Phase::Running);
        let now = Utc::now();
        status.transition_to(Phase::Completed, "WorkloadSucceeded", "done", now).unwrap();
        assert_eq!(status.completion_time, Some(now));
    }

    #[test]
    fn terminal_phases_are_sticky() {
        let mut status = status_in(Phase::Completed);
        let err = status
            .transition_to(Phase::Running, "x", "y", Utc::now())
            .unwrap_err();
        assert_eq!(err.reason(), "InvalidTransition");
        assert!(status.history.is_empty());
    }

    #[test]
    fn condition_merge_is_by_type() {
        let mut status = SessionStatus::default();
        let t0 = Utc::now();
        status.set_condition(condition_types::WORKLOAD_CREATED, ConditionStatus::True, "Created", "", t0);
        let t1 = t0 + chrono::Duration::seconds(5);
        status.set_condition(condition_types::WORKLOAD_CREATED, ConditionStatus::True, "Adopted", "", t1);

        assert_eq!(status.conditions.len(), 1);
        let cond = status.condition(condition_types::WORKLOAD_CREATED).unwrap();
        // Same status value: the transition time must not move.
        assert_eq!(cond.last_transition_time, t0);
        assert_eq!(cond.reason, "Adopted");

        let t2 = t1 + chrono::Duration::seconds(5);
        status.set_condition(condition_types::WORKLOAD_CREATED, ConditionStatus::False, "Lost", "", t2);
        assert_eq!(
            status.condition(condition_types::WORKLOAD_CREATED).unwrap().last_transition_time,
            t2
        );
    }

    #[test]
    fn immutable_field_diff() {
        let session = sample_session();
        let mut changed = session.clone();
        changed.spec.framework.version = "2.0".into();
        changed.spec.stop_requested = true;

        assert_eq!(session.changed_immutable_fields(&changed), vec!["spec.framework"]);
        let mut same = session.clone();
        same.spec.stop_requested = true;
        assert!(session.changed_immutable_fields(&same).is_empty());
    }

    #[test]
    fn name_validation() {
        assert!(is_valid_name("team-alpha"));
        assert!(is_valid_name("s-1234"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Team"));
        assert!(!is_valid_name("-lead"));
        assert!(!is_valid_name("trail-"));
        assert!(!is_valid_name("under_score"));
        assert!(!is_valid_name(&"x".repeat(64)));
    }

    #[test]
    fn wire_field_names_match_the_api() {
        let session = sample_session();
        let v = serde_json::to_value(&session).unwrap();
        assert_eq!(v["spec"]["trigger"]["source"], "github");
        assert_eq!(v["spec"]["framework"]["type"], "claude-code");
        assert_eq!(v["spec"]["policy"]["modelConstraints"]["budget"], "10.00");
        assert_eq!(v["status"]["phase"], "Pending");
        assert_eq!(v["spec"]["stopRequested"], false);
    }

    #[test]
    fn session_serde_round_trip_is_canonical() {
        let mut session = sample_session();
        session.status.append_history("WorkloadCreated", json!({"name": "w"}), Utc::now());
        session.status.set_condition(
            condition_types::WORKLOAD_CREATED,
            ConditionStatus::True,
            "Created",
            "",
            Utc::now(),
        );

        let encoded = serde_json::to_string(&session).unwrap();
        let decoded: Session = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, session);
        assert_eq!(
            crate::canonical::to_canonical_json(&decoded).unwrap(),
            crate::canonical::to_canonical_json(&session).unwrap()
        );
    }

    #[test]
    fn resource_usage_retains_unknown_counters() {
        let usage: ResourceUsage = serde_json::from_value(json!({
            "costCents": 120,
            "inputTokens": 9000,
            "gpuSeconds": 4,
        }))
        .unwrap();
        assert_eq!(usage.cost_cents, 120);
        assert_eq!(usage.extra["gpuSeconds"], json!(4));
        let back = serde_json::to_value(&usage).unwrap();
        assert_eq!(back["gpuSeconds"], json!(4));
    }

    pub(crate) fn sample_session() -> Session {
        Session {
            id: "sess-1".into(),
            tenant: "team-alpha".into(),
            spec: SessionSpec {
                trigger: Trigger {
                    source: "github".into(),
                    event: "pull_request_opened".into(),
                    payload: json!({"action": "opened"}),
                },
                framework: FrameworkSpec {
                    framework_type: "claude-code".into(),
                    version: "1.0".into(),
                    config: json!({"model": "claude-3-sonnet"}),
                },
                policy: PolicySnapshot {
                    model_constraints: ModelConstraints {
                        allowed: vec!["claude-3-sonnet".into()],
                        budget: BudgetAmount::from_cents(1000),
                    },
                    tool_constraints: ToolConstraints::default(),
                    approval_required: false,
                },
                artifact_storage: None,
                stop_requested: false,
                approval_decision: None,
            },
            status: SessionStatus::default(),
            trace_id: "trace-test".into(),
            created_at: Utc::now(),
        }
    }
}
