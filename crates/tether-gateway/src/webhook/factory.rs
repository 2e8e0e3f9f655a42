//! Session construction.
//!
//! Builds Session documents for both ingress paths: authenticated
//! webhooks and editor create requests on the read API. The tenant always
//! comes from the authenticated credential or the authorized URL path —
//! never from the payload — and the policy snapshot is taken from the
//! tenant's NamespacePolicy at construction time.

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use tether_core::resource::policy::NamespacePolicy;
use tether_core::resource::session::{
    ArtifactStorage, FrameworkSpec, ModelConstraints, PolicySnapshot, Session, SessionSpec,
    SessionStatus, ToolConstraints, Trigger,
};

/// Trigger source recorded for operator-created sessions.
pub const MANUAL_SOURCE: &str = "manual";

/// Defaults applied when a trigger does not name a framework.
#[derive(Debug, Clone)]
pub struct FactoryConfig {
    /// Framework type for webhook-triggered sessions.
    pub default_framework_type: String,
    /// Version tag for the default framework.
    pub default_framework_version: String,
    /// Artifact storage handed to runners, when configured.
    pub default_artifact_storage: Option<ArtifactStorage>,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            default_framework_type: "claude-code".to_string(),
            default_framework_version: "latest".to_string(),
            default_artifact_storage: None,
        }
    }
}

/// Partial spec accepted from editors on
/// `POST /v1/namespaces/{tenant}/sessions`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateSessionRequest {
    /// Explicit session id; generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    /// Framework selection; defaults apply when absent.
    #[serde(default)]
    pub framework: Option<FrameworkSpec>,
    /// Opaque trigger payload.
    #[serde(default)]
    pub payload: Option<Value>,
}

/// Builds sessions with tenant policy snapshots.
pub struct SessionFactory {
    config: FactoryConfig,
}

impl SessionFactory {
    /// Creates a factory.
    #[must_use]
    pub fn new(config: FactoryConfig) -> Self {
        Self { config }
    }

    /// Generates a session id.
    #[must_use]
    pub fn generate_id() -> String {
        let uuid = Uuid::new_v4().simple().to_string();
        format!("sess-{}", &uuid[..12])
    }

    /// Builds a session for an authenticated webhook event.
    #[must_use]
    pub fn from_webhook(
        &self,
        tenant: &str,
        source: &str,
        event: &str,
        payload: Value,
        policy: &NamespacePolicy,
        trace_id: &str,
    ) -> Session {
        self.build(
            Self::generate_id(),
            tenant,
            Trigger {
                source: source.to_string(),
                event: event.to_string(),
                payload,
            },
            None,
            policy,
            trace_id,
        )
    }

    /// Builds a session for an editor create request.
    #[must_use]
    pub fn from_request(
        &self,
        tenant: &str,
        request: CreateSessionRequest,
        policy: &NamespacePolicy,
        trace_id: &str,
    ) -> Session {
        self.build(
            request.id.unwrap_or_else(Self::generate_id),
            tenant,
            Trigger {
                source: MANUAL_SOURCE.to_string(),
                event: MANUAL_SOURCE.to_string(),
                payload: request.payload.unwrap_or(Value::Null),
            },
            request.framework,
            policy,
            trace_id,
        )
    }

    fn build(
        &self,
        id: String,
        tenant: &str,
        trigger: Trigger,
        framework: Option<FrameworkSpec>,
        policy: &NamespacePolicy,
        trace_id: &str,
    ) -> Session {
        let framework = framework.unwrap_or_else(|| FrameworkSpec {
            framework_type: self.config.default_framework_type.clone(),
            version: self.config.default_framework_version.clone(),
            config: Value::Null,
        });

        Session {
            id,
            tenant: tenant.to_string(),
            spec: SessionSpec {
                trigger,
                framework,
                policy: snapshot_of(policy),
                artifact_storage: self.config.default_artifact_storage.clone(),
                stop_requested: false,
                approval_decision: None,
            },
            status: SessionStatus::default(),
            trace_id: trace_id.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Snapshots the constraints a session inherits from its tenant policy:
/// the model allow-list, the tool lists, the remaining budget allowance
/// at this instant, and whether the tenant gates execution on approval.
#[must_use]
pub fn snapshot_of(policy: &NamespacePolicy) -> PolicySnapshot {
    PolicySnapshot {
        model_constraints: ModelConstraints {
            allowed: policy.spec.models.allowed.clone(),
            budget: policy.remaining_budget().unwrap_or_default(),
        },
        tool_constraints: ToolConstraints {
            allowed: policy.spec.tools.allowed.clone(),
            blocked: policy.spec.tools.blocked.clone(),
        },
        approval_required: policy.spec.limits.require_approval,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tether_core::resource::budget::BudgetAmount;
    use tether_core::resource::policy::{BudgetSpec, Currency};

    use super::*;

    fn factory() -> SessionFactory {
        SessionFactory::new(FactoryConfig::default())
    }

    #[test]
    fn webhook_sessions_get_defaults_and_snapshot() {
        let mut policy = NamespacePolicy::unrestricted("team-alpha");
        policy.spec.models.allowed = vec!["claude-3-sonnet".into()];
        policy.spec.models.budget = Some(BudgetSpec {
            monthly: BudgetAmount::parse("100.00").unwrap(),
            currency: Currency::USD,
            reset_day: 1,
        });
        policy.status.usage.budget.current_period = BudgetAmount::parse("30.00").unwrap();

        let session = factory().from_webhook(
            "team-alpha",
            "github",
            "pull_request_opened",
            json!({"action": "opened"}),
            &policy,
            "trace-9",
        );

        assert!(session.id.starts_with("sess-"));
        assert_eq!(session.tenant, "team-alpha");
        assert_eq!(session.spec.trigger.source, "github");
        assert_eq!(session.spec.framework.framework_type, "claude-code");
        assert_eq!(
            session.spec.policy.model_constraints.allowed,
            vec!["claude-3-sonnet".to_string()]
        );
        assert_eq!(
            session.spec.policy.model_constraints.budget,
            BudgetAmount::parse("70.00").unwrap()
        );
        assert_eq!(session.trace_id, "trace-9");
        assert!(tether_core::resource::session::is_valid_name(&session.id));
    }

    #[test]
    fn request_overrides_framework_and_id() {
        let policy = NamespacePolicy::unrestricted("team-alpha");
        let session = factory().from_request(
            "team-alpha",
            CreateSessionRequest {
                id: Some("my-session".into()),
                framework: Some(FrameworkSpec {
                    framework_type: "bash-runner".into(),
                    version: "2".into(),
                    config: json!({"timeout": 60}),
                }),
                payload: Some(json!({"task": "triage"})),
            },
            &policy,
            "trace-10",
        );

        assert_eq!(session.id, "my-session");
        assert_eq!(session.spec.trigger.source, MANUAL_SOURCE);
        assert_eq!(session.spec.framework.framework_type, "bash-runner");
        assert_eq!(session.spec.trigger.payload, json!({"task": "triage"}));
    }

    #[test]
    fn approval_gate_is_snapshotted_from_the_policy() {
        let mut policy = NamespacePolicy::unrestricted("team-alpha");
        policy.spec.limits.require_approval = true;

        let session = factory().from_webhook(
            "team-alpha",
            "github",
            "pull_request_opened",
            json!({}),
            &policy,
            "trace-11",
        );
        assert!(session.spec.policy.approval_required);
        assert!(session.spec.approval_decision.is_none());

        let ungated = factory().from_webhook(
            "team-alpha",
            "github",
            "pull_request_opened",
            json!({}),
            &NamespacePolicy::unrestricted("team-alpha"),
            "trace-12",
        );
        assert!(!ungated.spec.policy.approval_required);
    }

    #[test]
    fn generated_ids_are_unique_and_valid() {
        let a = SessionFactory::generate_id();
        let b = SessionFactory::generate_id();
        assert_ne!(a, b);
        assert!(tether_core::resource::session::is_valid_name(&a));
    }
}
