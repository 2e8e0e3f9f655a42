//! Webhook ingestion scenarios: authentication, server-side tenant
//! resolution, rate limiting, and admission.

mod common;

use axum::http::StatusCode;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;

use tether_core::resource::policy::{NamespacePolicy, RateLimitSpec};
use tether_core::resource::session::Phase;
use tether_gateway::webhook::auth::api_key_verifier;

use common::{gateway, TestGateway};

fn policy_with_github_key(tenant: &str, key: &str) -> NamespacePolicy {
    let mut policy = NamespacePolicy::unrestricted(tenant);
    policy
        .spec
        .webhook_auth
        .api_keys
        .insert("github".into(), api_key_verifier(key));
    policy
}

fn hmac_hex(secret: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(body);
    mac.finalize()
        .into_bytes()
        .iter()
        .fold(String::new(), |mut acc, b| {
            use std::fmt::Write;
            let _ = write!(acc, "{b:02x}");
            acc
        })
}

async fn post_github(
    gw: &TestGateway,
    headers: &[(&str, &str)],
    body: serde_json::Value,
) -> (StatusCode, serde_json::Value) {
    gw.request(
        "POST",
        "/webhooks/github",
        headers,
        Some(serde_json::to_vec(&body).unwrap()),
    )
    .await
}

#[tokio::test]
async fn github_api_key_happy_path() {
    let gw = gateway();
    gw.ctx
        .state
        .policies
        .create(policy_with_github_key("team-alpha", "KEY"))
        .unwrap();

    let (status, body) = post_github(
        &gw,
        &[("x-api-key", "KEY"), ("x-github-event", "pull_request")],
        json!({"action": "opened", "pull_request": {"id": 123}}),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["tenant"], "team-alpha");
    assert_eq!(body["status"], "accepted");
    let session_id = body["sessionId"].as_str().unwrap();
    assert!(body["estimatedStartTime"].is_string());

    let stored = gw.ctx.state.sessions.get("team-alpha", session_id).unwrap();
    assert_eq!(stored.resource.spec.trigger.source, "github");
    assert_eq!(stored.resource.spec.trigger.event, "pull_request_opened");
    assert!(matches!(
        stored.resource.status.phase,
        Phase::Pending | Phase::Running
    ));

    let audit = gw.ctx.state.audit.for_tenant("team-alpha");
    assert!(audit
        .iter()
        .any(|e| e.action == "session.create"
            && matches!(e.outcome, tether_core::audit::AuditOutcome::Allow)));
}

#[tokio::test]
async fn github_hmac_signature_resolves_signing_tenant() {
    let gw = gateway();
    let reference = gw.ctx.seed_signature_secret("team-beta", "github", "beta-secret");
    let mut policy = NamespacePolicy::unrestricted("team-beta");
    policy
        .spec
        .webhook_auth
        .signature_secret_refs
        .insert("github".into(), reference);
    gw.ctx.state.policies.create(policy).unwrap();

    let body = serde_json::to_vec(&json!({"action": "opened", "pull_request": {"id": 7}})).unwrap();
    let signature = format!("sha256={}", hmac_hex("beta-secret", &body));

    let (status, response) = gw
        .request(
            "POST",
            "/webhooks/github",
            &[
                ("x-hub-signature-256", signature.as_str()),
                ("x-github-event", "pull_request"),
            ],
            Some(body),
        )
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(response["tenant"], "team-beta");
}

#[tokio::test]
async fn tenant_hint_in_payload_is_ignored() {
    let gw = gateway();
    gw.ctx
        .state
        .policies
        .create(policy_with_github_key("team-alpha", "ALPHA-KEY"))
        .unwrap();
    gw.ctx
        .state
        .policies
        .create(policy_with_github_key("team-beta", "BETA-KEY"))
        .unwrap();

    // The payload claims team-beta; the credential says team-alpha.
    let (status, body) = post_github(
        &gw,
        &[("x-api-key", "ALPHA-KEY")],
        json!({"tenant": "team-beta", "namespace": "team-beta", "action": "opened"}),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["tenant"], "team-alpha");
    let session_id = body["sessionId"].as_str().unwrap();
    assert!(gw.ctx.state.sessions.get("team-alpha", session_id).is_some());
    assert!(gw.ctx.state.sessions.get("team-beta", session_id).is_none());
}

#[tokio::test]
async fn bad_credentials_are_denied_and_audited() {
    let gw = gateway();
    gw.ctx
        .state
        .policies
        .create(policy_with_github_key("team-alpha", "KEY"))
        .unwrap();

    let (status, body) = post_github(
        &gw,
        &[("x-api-key", "WRONG")],
        json!({"action": "opened"}),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 401);
    assert!(body["traceId"].is_string());
    assert!(gw.ctx.state.sessions.list("team-alpha").is_empty());
}

#[tokio::test]
async fn unknown_source_is_not_found() {
    let gw = gateway();
    let (status, _) = gw
        .request("POST", "/webhooks/pagerduty", &[("x-api-key", "K")], Some(b"{}".to_vec()))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn non_json_payload_is_rejected() {
    let gw = gateway();
    gw.ctx
        .state
        .policies
        .create(policy_with_github_key("team-alpha", "KEY"))
        .unwrap();

    let (status, body) = gw
        .request(
            "POST",
            "/webhooks/github",
            &[("x-api-key", "KEY")],
            Some(b"not json".to_vec()),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["reason"], "PayloadNotJson");
}

#[tokio::test]
async fn burst_over_the_limit_is_throttled() {
    let gw = gateway();
    let mut policy = policy_with_github_key("team-alpha", "KEY");
    policy.spec.webhook_auth.rate_limit = RateLimitSpec {
        requests_per_minute: 60,
        burst_size: 3,
    };
    gw.ctx.state.policies.create(policy).unwrap();

    for _ in 0..3 {
        let (status, _) = post_github(&gw, &[("x-api-key", "KEY")], json!({"n": 1})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }
    let (status, body) = post_github(&gw, &[("x-api-key", "KEY")], json!({"n": 4})).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], 429);
}

#[tokio::test]
async fn admission_rejection_surfaces_as_forbidden() {
    let gw = gateway();
    let mut policy = policy_with_github_key("team-alpha", "KEY");
    // Cap active sessions at zero: every webhook session is refused.
    policy.spec.limits.max_active_sessions = Some(0);
    gw.ctx.state.policies.create(policy).unwrap();

    let (status, body) = post_github(&gw, &[("x-api-key", "KEY")], json!({"n": 1})).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["reason"], "ActiveSessionCap");
    assert!(gw.ctx.state.sessions.list("team-alpha").is_empty());
}

#[tokio::test]
async fn jira_webhook_normalizes_issue_events() {
    let gw = gateway();
    let mut policy = NamespacePolicy::unrestricted("team-alpha");
    policy
        .spec
        .webhook_auth
        .api_keys
        .insert("jira".into(), api_key_verifier("JIRA-KEY"));
    gw.ctx.state.policies.create(policy).unwrap();

    let (status, body) = gw
        .request(
            "POST",
            "/webhooks/jira",
            &[("x-api-key", "JIRA-KEY")],
            Some(
                serde_json::to_vec(&json!({
                    "webhookEvent": "jira:issue_created",
                    "issue": {"key": "OPS-1"},
                }))
                .unwrap(),
            ),
        )
        .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    let session_id = body["sessionId"].as_str().unwrap();
    let stored = gw.ctx.state.sessions.get("team-alpha", session_id).unwrap();
    assert_eq!(stored.resource.spec.trigger.event, "issue_created");
    // The raw payload is retained verbatim.
    assert_eq!(stored.resource.spec.trigger.payload["issue"]["key"], "OPS-1");
}
