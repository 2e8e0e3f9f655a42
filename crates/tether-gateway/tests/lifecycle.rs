//! End-to-end lifecycle scenarios: reconciliation into workloads, runner
//! callbacks, graceful stop, retention sweeps, and the append-only
//! history guarantee.

mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use chrono::Utc;
use serde_json::json;

use tether_core::auth::Permission;
use tether_core::notify::Outbox;
use tether_core::reconcile::{
    PolicyReconciler, PolicyReconcilerConfig, Reconciler, SessionReconciler,
    SessionReconcilerConfig,
};
use tether_core::resource::policy::NamespacePolicy;
use tether_core::resource::retention::RetentionPeriod;
use tether_core::resource::session::Phase;
use tether_core::store::ResourceKey;
use tether_core::workload::{CallbackTokenIssuer, WorkloadState};
use tether_gateway::webhook::auth::api_key_verifier;

use common::{gateway, TestGateway};

struct Controllers {
    session: SessionReconciler,
    policy: PolicyReconciler,
}

fn controllers(gw: &TestGateway) -> Controllers {
    let state = &gw.ctx.state;
    let session = SessionReconciler::new(
        Arc::clone(&state.sessions),
        Arc::clone(&state.policies),
        Arc::clone(&state.registry),
        Arc::clone(&state.orchestrator),
        Arc::clone(&state.callback_tokens) as Arc<dyn CallbackTokenIssuer>,
        Outbox::disconnected(),
        Arc::clone(&state.audit),
        SessionReconcilerConfig {
            callback_base_url: "http://gateway.test".into(),
            stop_confirm_window: Duration::from_millis(100),
            ..SessionReconcilerConfig::default()
        },
    );
    let policy = PolicyReconciler::new(
        Arc::clone(&state.sessions),
        Arc::clone(&state.policies),
        Arc::clone(&state.audit),
        Outbox::disconnected(),
        PolicyReconcilerConfig::default(),
    );
    Controllers { session, policy }
}

async fn reconcile_session(c: &Controllers, id: &str) {
    c.session
        .reconcile(&ResourceKey::new("team-alpha", id))
        .await
        .unwrap();
}

fn seed_tenant(gw: &TestGateway, key: &str) {
    let mut policy = NamespacePolicy::unrestricted("team-alpha");
    policy
        .spec
        .webhook_auth
        .api_keys
        .insert("github".into(), api_key_verifier(key));
    gw.ctx.state.policies.create(policy).unwrap();
}

async fn webhook_session(gw: &TestGateway, key: &str) -> String {
    let (status, body) = gw
        .request(
            "POST",
            "/webhooks/github",
            &[("x-api-key", key), ("x-github-event", "pull_request")],
            Some(serde_json::to_vec(&json!({"action": "opened"})).unwrap()),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    body["sessionId"].as_str().unwrap().to_string()
}

/// Pulls the callback token out of the workload environment, the same
/// place the runner reads it from.
fn runner_token(gw: &TestGateway, session_id: &str) -> String {
    let spec = gw
        .ctx
        .orchestrator
        .spec_of("team-alpha", &format!("{session_id}-runner"))
        .expect("workload exists");
    spec.env
        .iter()
        .find(|e| e.name == "CALLBACK_TOKEN")
        .and_then(|e| e.value.clone())
        .expect("callback token in env")
}

#[tokio::test]
async fn webhook_to_completion_with_runner_callbacks() {
    let gw = gateway();
    seed_tenant(&gw, "KEY");
    let c = controllers(&gw);
    let id = webhook_session(&gw, "KEY").await;

    // Pending -> Running with a workload.
    reconcile_session(&c, &id).await;
    let session = gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource;
    assert_eq!(session.status.phase, Phase::Running);
    assert!(gw.ctx.orchestrator.exists("team-alpha", &format!("{id}-runner")));

    // The runner reports progress, logs, artifacts, and final usage.
    let token = runner_token(&gw, &id);
    let bearer = format!("Bearer {token}");

    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/callbacks/sessions/{id}/status"),
            &[("authorization", bearer.as_str())],
            Some(
                serde_json::to_vec(&json!({
                    "event": "RunnerProgress",
                    "data": {"step": "analyzing"},
                }))
                .unwrap(),
            ),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/callbacks/sessions/{id}/logs"),
            &[("authorization", bearer.as_str())],
            Some(serde_json::to_vec(&json!({"lines": ["cloning repo", "running agent"]})).unwrap()),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/callbacks/sessions/{id}/artifacts"),
            &[("authorization", bearer.as_str())],
            Some(
                serde_json::to_vec(&json!({
                    "artifacts": [{
                        "name": "change.diff",
                        "type": "diff",
                        "location": "s3://artifacts/change.diff",
                        "sizeBytes": 2048,
                        "checksum": "sha256:abc123",
                        "createdAt": Utc::now(),
                    }],
                }))
                .unwrap(),
            ),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/callbacks/sessions/{id}/status"),
            &[("authorization", bearer.as_str())],
            Some(
                serde_json::to_vec(&json!({
                    "event": "RunnerFinished",
                    "resourceUsage": {"costCents": 320, "inputTokens": 15000},
                }))
                .unwrap(),
            ),
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // Workload finishes; the session completes.
    gw.ctx
        .orchestrator
        .set_state("team-alpha", &format!("{id}-runner"), WorkloadState::Succeeded);
    reconcile_session(&c, &id).await;

    let session = gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource;
    assert_eq!(session.status.phase, Phase::Completed);
    assert_eq!(session.status.artifacts.len(), 1);
    assert_eq!(session.status.resource_usage.as_ref().unwrap().cost_cents, 320);
    let artifacts_stored = session
        .status
        .condition("ArtifactsStored")
        .expect("condition present");
    assert_eq!(
        artifacts_stored.status,
        tether_core::resource::session::ConditionStatus::True
    );

    // The read API serves the runner's logs and artifacts.
    gw.user("tok", "casey", &[("team-alpha", Permission::Viewer)]);
    let header = ("authorization", "Bearer tok".to_string());
    let (status, text) = gw
        .request_text(
            "GET",
            &format!("/v1/namespaces/team-alpha/sessions/{id}/logs"),
            &[(header.0, header.1.as_str())],
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(text, "cloning repo\nrunning agent\n");

    let (status, body) = gw
        .request(
            "GET",
            &format!("/v1/namespaces/team-alpha/sessions/{id}/artifacts"),
            &[(header.0, header.1.as_str())],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["name"], "change.diff");
}

#[tokio::test]
async fn callback_token_fences_other_sessions() {
    let gw = gateway();
    seed_tenant(&gw, "KEY");
    let c = controllers(&gw);
    let id_a = webhook_session(&gw, "KEY").await;
    let id_b = webhook_session(&gw, "KEY").await;
    reconcile_session(&c, &id_a).await;
    reconcile_session(&c, &id_b).await;

    // Session A's token may not report for session B.
    let token_a = runner_token(&gw, &id_a);
    let bearer = format!("Bearer {token_a}");
    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/callbacks/sessions/{id_b}/status"),
            &[("authorization", bearer.as_str())],
            Some(serde_json::to_vec(&json!({"event": "Spoof"})).unwrap()),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn graceful_stop_transitions_and_deletes_workload() {
    let gw = gateway();
    seed_tenant(&gw, "KEY");
    let c = controllers(&gw);
    let id = webhook_session(&gw, "KEY").await;
    reconcile_session(&c, &id).await;
    gw.ctx
        .orchestrator
        .set_state("team-alpha", &format!("{id}-runner"), WorkloadState::Running);

    gw.user("tok", "ed", &[("team-alpha", Permission::Editor)]);
    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/namespaces/team-alpha/sessions/{id}/stop"),
            &[("authorization", "Bearer tok")],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The reconciler observes the stop flag and settles the session.
    reconcile_session(&c, &id).await;

    let session = gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource;
    assert_eq!(session.status.phase, Phase::Stopped);
    assert!(!gw.ctx.orchestrator.exists("team-alpha", &format!("{id}-runner")));
    assert!(session
        .status
        .history
        .iter()
        .any(|e| e.event == "PhaseChanged:Stopped"));
}

#[tokio::test]
async fn approval_gate_holds_until_an_editor_approves() {
    let mut gw = gateway();
    let mut policy = NamespacePolicy::unrestricted("team-alpha");
    policy.spec.limits.require_approval = true;
    policy
        .spec
        .webhook_auth
        .api_keys
        .insert("github".into(), api_key_verifier("KEY"));
    gw.ctx.state.policies.create(policy).unwrap();
    let c = controllers(&gw);
    let id = webhook_session(&gw, "KEY").await;

    // Held in Pending with no workload until someone decides.
    reconcile_session(&c, &id).await;
    let session = gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource;
    assert_eq!(session.status.phase, Phase::Pending);
    assert!(!gw.ctx.orchestrator.exists("team-alpha", &format!("{id}-runner")));

    // Viewers cannot decide.
    gw.user("tok-viewer", "vee", &[("team-alpha", Permission::Viewer)]);
    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/namespaces/team-alpha/sessions/{id}/approve"),
            &[("authorization", "Bearer tok-viewer")],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    gw.user("tok", "ed", &[("team-alpha", Permission::Editor)]);
    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/namespaces/team-alpha/sessions/{id}/approve"),
            &[("authorization", "Bearer tok")],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // A second verdict is refused.
    let (status, body) = gw
        .request(
            "POST",
            &format!("/v1/namespaces/team-alpha/sessions/{id}/reject"),
            &[("authorization", "Bearer tok")],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["reason"], "AlreadyDecided");

    // The approval reaches the outbox.
    let mut events = Vec::new();
    while let Ok(n) = gw.ctx.outbox_rx.try_recv() {
        events.push(n.event);
    }
    assert!(events.contains(&tether_core::notify::NotificationEvent::SessionApproved));

    // The reconciler now starts the workload.
    reconcile_session(&c, &id).await;
    let session = gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource;
    assert_eq!(session.status.phase, Phase::Running);
    assert!(gw.ctx.orchestrator.exists("team-alpha", &format!("{id}-runner")));
    assert!(session
        .status
        .history
        .iter()
        .any(|e| e.event == "ApprovalGranted" && e.data["decidedBy"] == "ed"));
}

#[tokio::test]
async fn rejected_session_fails_and_never_runs() {
    let mut gw = gateway();
    let mut policy = NamespacePolicy::unrestricted("team-alpha");
    policy.spec.limits.require_approval = true;
    policy
        .spec
        .webhook_auth
        .api_keys
        .insert("github".into(), api_key_verifier("KEY"));
    gw.ctx.state.policies.create(policy).unwrap();
    let c = controllers(&gw);
    let id = webhook_session(&gw, "KEY").await;
    reconcile_session(&c, &id).await;

    gw.user("tok", "ed", &[("team-alpha", Permission::Editor)]);
    let (status, _) = gw
        .request(
            "POST",
            &format!("/v1/namespaces/team-alpha/sessions/{id}/reject"),
            &[("authorization", "Bearer tok")],
            None,
        )
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let mut events = Vec::new();
    while let Ok(n) = gw.ctx.outbox_rx.try_recv() {
        events.push(n.event);
    }
    assert!(events.contains(&tether_core::notify::NotificationEvent::SessionRejected));

    reconcile_session(&c, &id).await;
    let session = gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource;
    assert_eq!(session.status.phase, Phase::Failed);
    assert!(!gw.ctx.orchestrator.exists("team-alpha", &format!("{id}-runner")));
}

#[tokio::test]
async fn retention_sweep_deletes_expired_sessions_with_audit() {
    let gw = gateway();
    let mut policy = NamespacePolicy::unrestricted("team-alpha");
    policy.spec.retention.sessions = Some(RetentionPeriod::parse("7d").unwrap());
    policy
        .spec
        .webhook_auth
        .api_keys
        .insert("github".into(), api_key_verifier("KEY"));
    gw.ctx.state.policies.create(policy).unwrap();
    let c = controllers(&gw);

    let id = webhook_session(&gw, "KEY").await;
    reconcile_session(&c, &id).await;
    gw.ctx
        .orchestrator
        .set_state("team-alpha", &format!("{id}-runner"), WorkloadState::Succeeded);
    reconcile_session(&c, &id).await;

    // Backdate the completion to 8 days ago through a history-preserving
    // status edit.
    gw.ctx
        .state
        .sessions
        .update_with("team-alpha", &id, |s| {
            s.status.completion_time = Some(Utc::now() - chrono::Duration::days(8));
            Ok(())
        })
        .unwrap();

    c.policy.reconcile(&"team-alpha".to_string()).await.unwrap();

    assert!(gw.ctx.state.sessions.get("team-alpha", &id).is_none());
    assert!(gw
        .ctx
        .state
        .audit
        .for_tenant("team-alpha")
        .iter()
        .any(|e| e.action == "retention.sweep"));
}

#[tokio::test]
async fn history_prefix_is_immutable_through_the_store() {
    let gw = gateway();
    seed_tenant(&gw, "KEY");
    let c = controllers(&gw);
    let id = webhook_session(&gw, "KEY").await;
    reconcile_session(&c, &id).await;

    let stored = gw.ctx.state.sessions.get("team-alpha", &id).unwrap();
    assert!(stored.resource.status.history.len() >= 2);

    // Removing the first entry is rejected wholesale.
    let mut shortened = stored.resource.clone();
    shortened.status.history.remove(0);
    let err = gw
        .ctx
        .state
        .sessions
        .update(stored.version, shortened)
        .unwrap_err();
    assert_eq!(err.reason(), "HistoryShortened");

    // Rewriting an entry in place is rejected too.
    let mut mutated = stored.resource.clone();
    mutated.status.history[0].event = "Rewritten".into();
    let err = gw
        .ctx
        .state
        .sessions
        .update(stored.version, mutated)
        .unwrap_err();
    assert_eq!(err.reason(), "HistoryMutated");

    // The stored session is untouched.
    let after = gw.ctx.state.sessions.get("team-alpha", &id).unwrap();
    assert_eq!(after.version, stored.version);
}

#[tokio::test]
async fn policy_tightening_fails_running_sessions_via_policy_controller() {
    let gw = gateway();
    seed_tenant(&gw, "KEY");
    let c = controllers(&gw);
    let id = webhook_session(&gw, "KEY").await;
    reconcile_session(&c, &id).await;
    assert_eq!(
        gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource.status.phase,
        Phase::Running
    );

    // The session requests a model while the policy is still open...
    gw.ctx
        .state
        .sessions
        .update_with("team-alpha", &id, |s| {
            s.spec.policy.model_constraints.allowed = vec!["claude-3-sonnet".into()];
            Ok(())
        })
        .unwrap();
    // ...then the policy tightens and blocks it.
    gw.ctx
        .state
        .policies
        .update_with("team-alpha", "policy", |p| {
            p.spec.models.blocked = vec!["claude-3-sonnet".into()];
            Ok(())
        })
        .unwrap();

    c.policy.reconcile(&"team-alpha".to_string()).await.unwrap();

    let session = gw.ctx.state.sessions.get("team-alpha", &id).unwrap().resource;
    assert_eq!(session.status.phase, Phase::Failed);
    assert!(session
        .status
        .history
        .iter()
        .any(|e| e.event == "PhaseChanged:Failed"));
}
