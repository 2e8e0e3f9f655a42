//! The session controller.
//!
//! Drives each Session through the lifecycle DAG: validates Pending
//! sessions against the current policy (policies may have tightened since
//! admission), creates the runner workload, watches it run, and settles
//! the session into a terminal phase. Every transition commits phase,
//! conditions, and history together through one CAS update, and the
//! current-phase guard inside each commit makes reconciles safe to replay
//! after a controller restart.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::admission::evaluate_against_policy;
use crate::audit::{AuditEntry, AuditLog, AuditOutcome};
use crate::error::{ErrorKind, Result};
use crate::framework::{FrameworkRegistry, ParsedFrameworkConfig};
use crate::notify::{NotificationEvent, Outbox};
use crate::resource::policy::NamespacePolicy;
use crate::resource::session::{
    condition_types, ApprovalDecision, ConditionStatus, Phase, Session,
};
use crate::resource::POLICY_NAME;
use crate::store::{Resource, ResourceKey, TypedStore, WatchEvent};
use crate::workload::{
    build_workload_spec, workload_name, CallbackTokenIssuer, RunnerBinding, WorkloadApi,
    WorkloadState,
};

use super::{Reconciler, Requeue, WorkQueue};

/// History event recorded when stop intent is first observed.
const STOP_REQUESTED_EVENT: &str = "StopRequested";

/// Tuning knobs for the session controller.
#[derive(Debug, Clone)]
pub struct SessionReconcilerConfig {
    /// Base URL runners call back on.
    pub callback_base_url: String,
    /// Poll interval while a workload runs; bounded 10–60 s in production
    /// profiles, shorter in tests.
    pub running_poll_interval: Duration,
    /// How long a stop may wait for workload deletion to confirm before
    /// the session fails `StopHung`.
    pub stop_confirm_window: Duration,
    /// Poll interval while waiting for a stop to confirm.
    pub stop_poll_interval: Duration,
}

impl Default for SessionReconcilerConfig {
    fn default() -> Self {
        Self {
            callback_base_url: "http://localhost:8080".to_string(),
            running_poll_interval: Duration::from_secs(15),
            stop_confirm_window: Duration::from_secs(60),
            stop_poll_interval: Duration::from_secs(2),
        }
    }
}

/// Reconciles Sessions into workload executions.
pub struct SessionReconciler {
    sessions: Arc<TypedStore<Session>>,
    policies: Arc<TypedStore<NamespacePolicy>>,
    registry: Arc<FrameworkRegistry>,
    orchestrator: Arc<dyn WorkloadApi>,
    tokens: Arc<dyn CallbackTokenIssuer>,
    outbox: Outbox,
    audit: Arc<AuditLog>,
    config: SessionReconcilerConfig,
}

impl SessionReconciler {
    /// Creates the controller.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        sessions: Arc<TypedStore<Session>>,
        policies: Arc<TypedStore<NamespacePolicy>>,
        registry: Arc<FrameworkRegistry>,
        orchestrator: Arc<dyn WorkloadApi>,
        tokens: Arc<dyn CallbackTokenIssuer>,
        outbox: Outbox,
        audit: Arc<AuditLog>,
        config: SessionReconcilerConfig,
    ) -> Self {
        Self {
            sessions,
            policies,
            registry,
            orchestrator,
            tokens,
            outbox,
            audit,
            config,
        }
    }

    /// Wires the controller to its store: enqueues all existing sessions
    /// (restart resync), then follows the watch stream. Deleted sessions
    /// get their workload reaped (owner cascade).
    pub fn spawn_watch(self: &Arc<Self>, queue: &Arc<WorkQueue<ResourceKey>>) -> tokio::task::JoinHandle<()> {
        let mut watch = self.sessions.watch();
        for stored in self.sessions.list_all() {
            queue.enqueue(stored.resource.key());
        }

        let queue = Arc::clone(queue);
        let reconciler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match watch.recv().await {
                    Ok(WatchEvent::Created(stored) | WatchEvent::Updated(stored)) => {
                        queue.enqueue(stored.resource.key());
                    }
                    Ok(WatchEvent::Deleted(key)) => {
                        let orchestrator = Arc::clone(&reconciler.orchestrator);
                        tokio::spawn(async move {
                            let name = workload_name(&key.name);
                            if let Err(e) = orchestrator.delete(&key.tenant, &name).await {
                                tracing::warn!(
                                    tenant = %key.tenant,
                                    workload = %name,
                                    error = %e,
                                    "cascade workload delete failed"
                                );
                            }
                        });
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "session watch lagged, resyncing all sessions");
                        for stored in reconciler.sessions.list_all() {
                            queue.enqueue(stored.resource.key());
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn effective_policy(&self, tenant: &str) -> NamespacePolicy {
        self.policies
            .get(tenant, POLICY_NAME)
            .map_or_else(|| NamespacePolicy::unrestricted(tenant), |s| s.resource)
    }

    /// Fails a non-terminal session with one atomic transition. No-op if
    /// the session reached a terminal phase in the meantime.
    fn fail_session(&self, tenant: &str, id: &str, reason: &str, message: &str) -> Result<()> {
        let mut transitioned = false;
        self.sessions.update_with(tenant, id, |s| {
            transitioned = false;
            if s.status.phase.is_terminal() {
                return Ok(());
            }
            s.status.transition_to(Phase::Failed, reason, message, Utc::now())?;
            transitioned = true;
            Ok(())
        })?;
        if transitioned {
            self.outbox.publish(
                tenant,
                NotificationEvent::SessionFailed,
                Some(id),
                json!({ "reason": reason, "message": message }),
            );
        }
        Ok(())
    }

    async fn handle_pending(&self, session: Session) -> Result<Requeue> {
        let tenant = session.tenant.clone();
        let id = session.id.clone();

        // Policies may have tightened since admission; do not start a
        // workload for a spec the current policy rejects.
        let policy = self.effective_policy(&tenant);
        if let Err(violation) = evaluate_against_policy(&session, &policy) {
            self.audit.record(
                AuditEntry::now(
                    &tenant,
                    "session-reconciler",
                    "session.revalidate",
                    "Session",
                    AuditOutcome::Deny,
                    &session.trace_id,
                )
                .session(&id)
                .detail(violation.to_string()),
            );
            self.sessions.update_with(&tenant, &id, |s| {
                if s.status.phase.is_terminal() {
                    return Ok(());
                }
                s.status.set_condition(
                    condition_types::POLICY_VALIDATED,
                    ConditionStatus::False,
                    violation.reason(),
                    violation.message(),
                    Utc::now(),
                );
                s.status.transition_to(
                    Phase::Failed,
                    "PolicyViolation",
                    violation.message(),
                    Utc::now(),
                )
            })?;
            self.outbox.publish(
                &tenant,
                NotificationEvent::SessionFailed,
                Some(&id),
                json!({ "reason": "PolicyViolation", "message": violation.message() }),
            );
            return Ok(Requeue::No);
        }

        // Approval gate: a gated session holds in Pending until an editor
        // records a verdict; a rejection fails it without ever starting a
        // workload.
        if session.spec.policy.approval_required {
            match session.spec.approval_decision {
                Some(ApprovalDecision::Rejected) => {
                    self.fail_session(
                        &tenant,
                        &id,
                        "ApprovalRejected",
                        "session was rejected by an editor",
                    )?;
                    return Ok(Requeue::No);
                }
                None => {
                    if session
                        .status
                        .condition(condition_types::APPROVAL_GRANTED)
                        .is_none()
                    {
                        self.sessions.update_with(&tenant, &id, |s| {
                            if s.status.phase != Phase::Pending {
                                return Ok(());
                            }
                            s.status.set_condition(
                                condition_types::APPROVAL_GRANTED,
                                ConditionStatus::Unknown,
                                "AwaitingApproval",
                                "session is waiting for editor approval",
                                Utc::now(),
                            );
                            Ok(())
                        })?;
                    }
                    // The approval update re-enqueues via the watch stream.
                    return Ok(Requeue::No);
                }
                Some(ApprovalDecision::Approved) => {}
            }
        }

        let Some(entry) = self.registry.get(&session.spec.framework.framework_type) else {
            self.fail_session(
                &tenant,
                &id,
                "UnknownFramework",
                &format!(
                    "framework type {:?} is not registered",
                    session.spec.framework.framework_type
                ),
            )?;
            return Ok(Requeue::No);
        };
        let entry = entry.clone();

        let parsed = match ParsedFrameworkConfig::from_value(&session.spec.framework.config) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.fail_session(&tenant, &id, e.reason(), e.message())?;
                return Ok(Requeue::No);
            }
        };

        let token = self.tokens.issue(&tenant, &id);
        let binding = RunnerBinding {
            callback_base_url: &self.config.callback_base_url,
            callback_token: &token,
            trace_id: &session.trace_id,
        };
        let spec = build_workload_spec(&session, &entry, &parsed, &binding);

        let workload_ref = match self.orchestrator.create(&spec).await {
            Ok(workload_ref) => workload_ref,
            Err(e) if e.kind() == ErrorKind::Conflict => {
                self.fail_session(&tenant, &id, "WorkloadNameConflict", e.message())?;
                return Ok(Requeue::No);
            }
            Err(e) if e.kind() == ErrorKind::Transient => return Err(e),
            Err(e) => {
                self.fail_session(&tenant, &id, e.reason(), e.message())?;
                return Ok(Requeue::No);
            }
        };

        tracing::info!(
            tenant = %tenant,
            session = %id,
            workload = %workload_ref.name,
            "workload created"
        );

        self.sessions.update_with(&tenant, &id, |s| {
            if s.status.phase != Phase::Pending {
                // Another pass already advanced this session.
                return Ok(());
            }
            let now = Utc::now();
            s.status.set_condition(
                condition_types::POLICY_VALIDATED,
                ConditionStatus::True,
                "PolicySatisfied",
                "session satisfies the tenant policy",
                now,
            );
            if s.spec.policy.approval_required {
                s.status.set_condition(
                    condition_types::APPROVAL_GRANTED,
                    ConditionStatus::True,
                    "Approved",
                    "session approved for execution",
                    now,
                );
            }
            s.status.set_condition(
                condition_types::WORKLOAD_CREATED,
                ConditionStatus::True,
                "Created",
                &format!("workload {} created", workload_ref.name),
                now,
            );
            s.status.append_history(
                "WorkloadCreated",
                json!({ "name": workload_ref.name, "uid": workload_ref.uid }),
                now,
            );
            s.status.workload_ref = Some(workload_ref.clone());
            s.status.start_time = Some(now);
            s.status.transition_to(Phase::Running, "WorkloadCreated", "runner starting", now)
        })?;

        self.outbox.publish(
            &tenant,
            NotificationEvent::SessionStarted,
            Some(&id),
            json!({ "workload": workload_ref.name }),
        );
        Ok(Requeue::After(self.config.running_poll_interval))
    }

    async fn handle_running(&self, session: Session) -> Result<Requeue> {
        if session.spec.stop_requested {
            return self.handle_stop(&session).await;
        }

        let tenant = session.tenant.clone();
        let id = session.id.clone();
        let name = session
            .status
            .workload_ref
            .as_ref()
            .map_or_else(|| workload_name(&id), |r| r.name.clone());

        let Some(status) = self.orchestrator.status(&tenant, &name).await? else {
            self.fail_session(
                &tenant,
                &id,
                "WorkloadLost",
                &format!("workload {name} disappeared while running"),
            )?;
            return Ok(Requeue::No);
        };

        match status.state {
            WorkloadState::Succeeded => {
                self.sessions.update_with(&tenant, &id, |s| {
                    if s.status.phase != Phase::Running {
                        return Ok(());
                    }
                    let now = Utc::now();
                    let (artifacts, reason, message) = if s.status.artifacts.is_empty() {
                        (
                            ConditionStatus::Unknown,
                            "NoArtifactsReported",
                            "runner finished without registering artifacts",
                        )
                    } else {
                        (
                            ConditionStatus::True,
                            "ArtifactsReported",
                            "runner registered artifact references",
                        )
                    };
                    s.status.set_condition(
                        condition_types::ARTIFACTS_STORED,
                        artifacts,
                        reason,
                        message,
                        now,
                    );
                    s.status.set_condition(
                        condition_types::WORKLOAD_RUNNING,
                        ConditionStatus::False,
                        "Finished",
                        "workload finished",
                        now,
                    );
                    s.status.transition_to(Phase::Completed, "WorkloadSucceeded", "runner exited 0", now)
                })?;
                self.outbox.publish(
                    &tenant,
                    NotificationEvent::SessionCompleted,
                    Some(&id),
                    json!({}),
                );
                Ok(Requeue::No)
            }
            WorkloadState::Failed { exit_code, reason } => {
                let message = match exit_code {
                    Some(code) => format!("workload failed ({reason}, exit code {code})"),
                    None => format!("workload failed ({reason})"),
                };
                self.fail_session(&tenant, &id, "WorkloadFailed", &message)?;
                Ok(Requeue::No)
            }
            WorkloadState::Pending | WorkloadState::Running => {
                if self.deadline_exceeded(&session) {
                    // Best-effort: the orchestrator also enforces the
                    // active deadline.
                    if let Err(e) = self.orchestrator.delete(&tenant, &name).await {
                        tracing::warn!(
                            tenant = %tenant,
                            session = %id,
                            error = %e,
                            "workload delete after deadline failed"
                        );
                    }
                    self.sessions.update_with(&tenant, &id, |s| {
                        if s.status.phase != Phase::Running {
                            return Ok(());
                        }
                        s.status.transition_to(
                            Phase::TimedOut,
                            "DeadlineExceeded",
                            "session exceeded its execution deadline",
                            Utc::now(),
                        )
                    })?;
                    self.outbox.publish(
                        &tenant,
                        NotificationEvent::SessionFailed,
                        Some(&id),
                        json!({ "reason": "DeadlineExceeded" }),
                    );
                    return Ok(Requeue::No);
                }

                if matches!(status.state, WorkloadState::Running)
                    && session
                        .status
                        .condition(condition_types::WORKLOAD_RUNNING)
                        .is_none_or(|c| c.status != ConditionStatus::True)
                {
                    self.sessions.update_with(&tenant, &id, |s| {
                        if s.status.phase != Phase::Running {
                            return Ok(());
                        }
                        s.status.set_condition(
                            condition_types::WORKLOAD_RUNNING,
                            ConditionStatus::True,
                            "Running",
                            "runner container is executing",
                            Utc::now(),
                        );
                        Ok(())
                    })?;
                }
                Ok(Requeue::After(self.config.running_poll_interval))
            }
        }
    }

    async fn handle_stop(&self, session: &Session) -> Result<Requeue> {
        let tenant = &session.tenant;
        let id = &session.id;
        let name = workload_name(id);

        let stop_marker = session
            .status
            .history
            .iter()
            .rev()
            .find(|h| h.event == STOP_REQUESTED_EVENT)
            .map(|h| h.timestamp);
        if stop_marker.is_none() {
            self.sessions.update_with(tenant, id, |s| {
                if s.status.phase != Phase::Running {
                    return Ok(());
                }
                if !s.status.history.iter().any(|h| h.event == STOP_REQUESTED_EVENT) {
                    s.status.append_history(STOP_REQUESTED_EVENT, json!({}), Utc::now());
                }
                Ok(())
            })?;
        }
        let stop_started = stop_marker.unwrap_or_else(Utc::now);

        self.orchestrator.delete(tenant, &name).await?;
        let gone = self.orchestrator.status(tenant, &name).await?.is_none();

        if gone {
            self.sessions.update_with(tenant, id, |s| {
                if s.status.phase != Phase::Running {
                    return Ok(());
                }
                let now = Utc::now();
                s.status.set_condition(
                    condition_types::WORKLOAD_RUNNING,
                    ConditionStatus::False,
                    "Stopped",
                    "workload deleted on stop request",
                    now,
                );
                s.status.transition_to(Phase::Stopped, "StopRequested", "stopped by request", now)
            })?;
            self.outbox.publish(
                tenant,
                NotificationEvent::SessionFailed,
                Some(id),
                json!({ "reason": "Stopped" }),
            );
            return Ok(Requeue::No);
        }

        let waited = Utc::now().signed_duration_since(stop_started);
        if waited.to_std().unwrap_or_default() > self.config.stop_confirm_window {
            self.fail_session(
                tenant,
                id,
                "StopHung",
                "workload deletion did not confirm within the stop window",
            )?;
            return Ok(Requeue::No);
        }
        Ok(Requeue::After(self.config.stop_poll_interval))
    }

    async fn handle_terminal(&self, session: Session) -> Result<Requeue> {
        // Stopped and timed-out sessions must not leave a runner behind;
        // completed/failed workloads are retained for log retrieval until
        // the orchestrator's TTL reaps them.
        if matches!(session.status.phase, Phase::Stopped | Phase::TimedOut) {
            let name = workload_name(&session.id);
            if self
                .orchestrator
                .status(&session.tenant, &name)
                .await?
                .is_some()
            {
                self.orchestrator.delete(&session.tenant, &name).await?;
            }
        }
        Ok(Requeue::No)
    }
}

#[async_trait::async_trait]
impl Reconciler for SessionReconciler {
    type Key = ResourceKey;

    fn name(&self) -> &'static str {
        "session-reconciler"
    }

    async fn reconcile(&self, key: &ResourceKey) -> Result<Requeue> {
        let Some(stored) = self.sessions.get(&key.tenant, &key.name) else {
            return Ok(Requeue::No);
        };
        let session = stored.resource;
        match session.status.phase {
            Phase::Pending => self.handle_pending(session).await,
            Phase::Running => self.handle_running(session).await,
            Phase::Completed | Phase::Failed | Phase::Stopped | Phase::TimedOut => {
                self.handle_terminal(session).await
            }
        }
    }
}

impl SessionReconciler {
    fn deadline_exceeded(&self, session: &Session) -> bool {
        let Some(entry) = self.registry.get(&session.spec.framework.framework_type) else {
            return false;
        };
        let parsed =
            ParsedFrameworkConfig::from_value(&session.spec.framework.config).unwrap_or_default();
        let deadline = FrameworkRegistry::effective_timeout(entry, &parsed);
        let started = session.status.start_time.unwrap_or(session.created_at);
        Utc::now()
            .signed_duration_since(started)
            .to_std()
            .is_ok_and(|elapsed| elapsed > deadline)
    }
}

#[cfg(test)]
mod tests {
    use secrecy::SecretString;
    use serde_json::json;

    use super::*;
    use crate::admission::SessionValidator;
    use crate::resource::session::{
        FrameworkSpec, PolicySnapshot, SessionSpec, SessionStatus, Trigger,
    };
    use crate::workload::fake::FakeOrchestrator;

    struct StaticTokens;

    impl CallbackTokenIssuer for StaticTokens {
        fn issue(&self, _tenant: &str, _session_id: &str) -> SecretString {
            SecretString::from("test-token")
        }
    }

    struct Harness {
        sessions: Arc<TypedStore<Session>>,
        policies: Arc<TypedStore<NamespacePolicy>>,
        orchestrator: Arc<FakeOrchestrator>,
        reconciler: Arc<SessionReconciler>,
    }

    fn harness() -> Harness {
        let sessions = Arc::new(TypedStore::<Session>::new());
        let policies = Arc::new(TypedStore::<NamespacePolicy>::new());
        let registry = Arc::new(FrameworkRegistry::builtin());
        SessionValidator::install(&sessions, Arc::clone(&policies), Arc::clone(&registry));
        let orchestrator = Arc::new(FakeOrchestrator::new());
        let reconciler = Arc::new(SessionReconciler::new(
            Arc::clone(&sessions),
            Arc::clone(&policies),
            registry,
            Arc::clone(&orchestrator) as Arc<dyn WorkloadApi>,
            Arc::new(StaticTokens),
            Outbox::disconnected(),
            Arc::new(AuditLog::new()),
            SessionReconcilerConfig {
                stop_confirm_window: Duration::from_millis(50),
                ..SessionReconcilerConfig::default()
            },
        ));
        Harness {
            sessions,
            policies,
            orchestrator,
            reconciler,
        }
    }

    fn make_session(id: &str) -> Session {
        Session {
            id: id.into(),
            tenant: "team-alpha".into(),
            spec: SessionSpec {
                trigger: Trigger {
                    source: "manual".into(),
                    event: "manual".into(),
                    payload: json!({}),
                },
                framework: FrameworkSpec {
                    framework_type: "claude-code".into(),
                    version: "latest".into(),
                    config: json!({}),
                },
                policy: PolicySnapshot::default(),
                artifact_storage: None,
                stop_requested: false,
                approval_decision: None,
            },
            status: SessionStatus::default(),
            trace_id: "trace-rec".into(),
            created_at: Utc::now(),
        }
    }

    fn key(id: &str) -> ResourceKey {
        ResourceKey::new("team-alpha", id)
    }

    async fn reconcile(h: &Harness, id: &str) -> Requeue {
        h.reconciler.reconcile(&key(id)).await.unwrap()
    }

    fn phase(h: &Harness, id: &str) -> Phase {
        h.sessions.get("team-alpha", id).unwrap().resource.status.phase
    }

    #[tokio::test]
    async fn pending_session_becomes_running_with_workload() {
        let h = harness();
        h.sessions.create(make_session("s-1")).unwrap();

        let requeue = reconcile(&h, "s-1").await;
        assert!(matches!(requeue, Requeue::After(_)));
        assert_eq!(phase(&h, "s-1"), Phase::Running);
        assert!(h.orchestrator.exists("team-alpha", "s-1-runner"));

        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert!(session.status.workload_ref.is_some());
        assert!(session.status.start_time.is_some());
        assert_eq!(
            session
                .status
                .condition(condition_types::WORKLOAD_CREATED)
                .unwrap()
                .status,
            ConditionStatus::True
        );
        let events: Vec<&str> = session.status.history.iter().map(|h| h.event.as_str()).collect();
        assert_eq!(events, vec!["WorkloadCreated", "PhaseChanged:Running"]);
    }

    #[tokio::test]
    async fn tightened_policy_fails_pending_session_before_start() {
        let h = harness();
        let mut session = make_session("s-1");
        session.spec.framework.config = json!({"model": "claude-3-opus"});
        h.sessions.create(session).unwrap();

        // Policy tightens after admission.
        let mut policy = NamespacePolicy::unrestricted("team-alpha");
        policy.spec.models.blocked = vec!["claude-3-opus".into()];
        h.policies.create(policy).unwrap();

        reconcile(&h, "s-1").await;
        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Failed);
        assert!(!h.orchestrator.exists("team-alpha", "s-1-runner"));
        assert_eq!(
            session
                .status
                .condition(condition_types::POLICY_VALIDATED)
                .unwrap()
                .status,
            ConditionStatus::False
        );
        assert!(session
            .status
            .history
            .iter()
            .any(|e| e.event == "PhaseChanged:Failed"));
    }

    #[tokio::test]
    async fn approval_gated_session_waits_then_runs_when_approved() {
        let h = harness();
        let mut session = make_session("s-1");
        session.spec.policy.approval_required = true;
        h.sessions.create(session).unwrap();

        // Held in Pending, no workload, condition marks the wait.
        reconcile(&h, "s-1").await;
        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Pending);
        assert!(!h.orchestrator.exists("team-alpha", "s-1-runner"));
        assert_eq!(
            session
                .status
                .condition(condition_types::APPROVAL_GRANTED)
                .unwrap()
                .status,
            ConditionStatus::Unknown
        );

        // Holding is stable across repeated reconciles.
        let before = h.sessions.get("team-alpha", "s-1").unwrap().version;
        reconcile(&h, "s-1").await;
        assert_eq!(h.sessions.get("team-alpha", "s-1").unwrap().version, before);

        h.sessions
            .update_with("team-alpha", "s-1", |s| {
                s.spec.approval_decision = Some(ApprovalDecision::Approved);
                Ok(())
            })
            .unwrap();
        reconcile(&h, "s-1").await;

        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Running);
        assert!(h.orchestrator.exists("team-alpha", "s-1-runner"));
        assert_eq!(
            session
                .status
                .condition(condition_types::APPROVAL_GRANTED)
                .unwrap()
                .status,
            ConditionStatus::True
        );
    }

    #[tokio::test]
    async fn rejected_session_fails_without_a_workload() {
        let h = harness();
        let mut session = make_session("s-1");
        session.spec.policy.approval_required = true;
        h.sessions.create(session).unwrap();
        h.sessions
            .update_with("team-alpha", "s-1", |s| {
                s.spec.approval_decision = Some(ApprovalDecision::Rejected);
                Ok(())
            })
            .unwrap();

        reconcile(&h, "s-1").await;

        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Failed);
        assert!(!h.orchestrator.exists("team-alpha", "s-1-runner"));
        assert!(session
            .status
            .history
            .iter()
            .any(|e| e.data["reason"] == "ApprovalRejected"));
    }

    #[tokio::test]
    async fn workload_name_conflict_fails_the_session() {
        let h = harness();
        // A foreign workload already squats on the derived name.
        h.sessions.create(make_session("squatter")).unwrap();
        reconcile(&h, "squatter").await;
        let mut stolen = h.orchestrator.spec_of("team-alpha", "squatter-runner").unwrap();
        stolen.name = "s-1-runner".into();
        h.orchestrator.create(&stolen).await.unwrap();

        h.sessions.create(make_session("s-1")).unwrap();

        reconcile(&h, "s-1").await;
        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Failed);
        assert!(session
            .status
            .history
            .iter()
            .any(|e| e.data["reason"] == "WorkloadNameConflict"));
    }

    #[tokio::test]
    async fn succeeded_workload_completes_the_session() {
        let h = harness();
        h.sessions.create(make_session("s-1")).unwrap();
        reconcile(&h, "s-1").await;

        h.orchestrator.set_state("team-alpha", "s-1-runner", WorkloadState::Succeeded);
        let requeue = reconcile(&h, "s-1").await;

        assert_eq!(requeue, Requeue::No);
        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Completed);
        assert!(session.status.completion_time.is_some());
        // No artifacts were reported, so the condition is Unknown.
        assert_eq!(
            session
                .status
                .condition(condition_types::ARTIFACTS_STORED)
                .unwrap()
                .status,
            ConditionStatus::Unknown
        );
    }

    #[tokio::test]
    async fn failed_workload_fails_the_session_with_exit_detail() {
        let h = harness();
        h.sessions.create(make_session("s-1")).unwrap();
        reconcile(&h, "s-1").await;

        h.orchestrator.set_state(
            "team-alpha",
            "s-1-runner",
            WorkloadState::Failed {
                exit_code: Some(2),
                reason: "OOMKilled".into(),
            },
        );
        reconcile(&h, "s-1").await;

        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Failed);
        let last = session.status.history.last().unwrap();
        assert_eq!(last.event, "PhaseChanged:Failed");
        assert!(last.data["message"].as_str().unwrap().contains("OOMKilled"));
    }

    #[tokio::test]
    async fn vanished_workload_fails_the_session() {
        let h = harness();
        h.sessions.create(make_session("s-1")).unwrap();
        reconcile(&h, "s-1").await;

        h.orchestrator.vanish("team-alpha", "s-1-runner");
        reconcile(&h, "s-1").await;

        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Failed);
        assert!(session
            .status
            .history
            .iter()
            .any(|e| e.data["reason"] == "WorkloadLost"));
    }

    #[tokio::test]
    async fn stop_request_deletes_workload_and_stops() {
        let h = harness();
        h.sessions.create(make_session("s-1")).unwrap();
        reconcile(&h, "s-1").await;
        h.orchestrator.set_state("team-alpha", "s-1-runner", WorkloadState::Running);

        h.sessions
            .update_with("team-alpha", "s-1", |s| {
                s.spec.stop_requested = true;
                Ok(())
            })
            .unwrap();
        reconcile(&h, "s-1").await;

        let session = h.sessions.get("team-alpha", "s-1").unwrap().resource;
        assert_eq!(session.status.phase, Phase::Stopped);
        assert!(!h.orchestrator.exists("team-alpha", "s-1-runner"));
        assert!(session
            .status
            .history
            .iter()
            .any(|e| e.event == "PhaseChanged:Stopped"));
    }

    #[tokio::test]
    async fn transient_orchestrator_failure_bubbles_for_requeue() {
        let h = harness();
        h.sessions.create(make_session("s-1")).unwrap();
        h.orchestrator.set_outage(true);

        let err = h.reconciler.reconcile(&key("s-1")).await.unwrap_err();
        assert!(err.kind().is_retryable());
        assert_eq!(phase(&h, "s-1"), Phase::Pending);

        h.orchestrator.set_outage(false);
        reconcile(&h, "s-1").await;
        assert_eq!(phase(&h, "s-1"), Phase::Running);
    }

    #[tokio::test]
    async fn terminal_session_reconcile_is_inert() {
        let h = harness();
        h.sessions.create(make_session("s-1")).unwrap();
        reconcile(&h, "s-1").await;
        h.orchestrator.set_state("team-alpha", "s-1-runner", WorkloadState::Succeeded);
        reconcile(&h, "s-1").await;

        let before = h.sessions.get("team-alpha", "s-1").unwrap();
        for _ in 0..3 {
            assert_eq!(reconcile(&h, "s-1").await, Requeue::No);
        }
        let after = h.sessions.get("team-alpha", "s-1").unwrap();
        assert_eq!(before.version, after.version);
        assert_eq!(before.resource, after.resource);
    }

    #[tokio::test]
    async fn missing_session_is_a_no_op() {
        let h = harness();
        assert_eq!(reconcile(&h, "ghost").await, Requeue::No);
    }
}
