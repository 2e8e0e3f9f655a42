//! Session admission.
//!
//! Create: framework must be registered, names must be shaped like DNS
//! labels, the policy snapshot must satisfy the tenant's NamespacePolicy
//! at this instant (models, tools, budget, active-session cap), and the
//! status block must be virgin — clients do not get to invent history.
//!
//! Update: immutable fields stay put, `status.history` is append-only
//! with a byte-identical prefix under canonical JSON, and phase changes
//! must ride an edge of the lifecycle DAG (terminal phases are sticky).

use std::sync::{Arc, Weak};

use crate::canonical::to_canonical_json;
use crate::error::{Error, Result};
use crate::framework::{FrameworkRegistry, ParsedFrameworkConfig};
use crate::resource::policy::NamespacePolicy;
use crate::resource::session::{is_valid_name, Phase, Session};
use crate::store::{AdmissionHook, TypedStore};

/// Validates Session writes against schema and tenant policy.
pub struct SessionValidator {
    policies: Arc<TypedStore<NamespacePolicy>>,
    /// Weak: the validator is owned by the session store it guards.
    sessions: Weak<TypedStore<Session>>,
    registry: Arc<FrameworkRegistry>,
}

impl SessionValidator {
    /// Creates a validator and registers it on the session store.
    pub fn install(
        sessions: &Arc<TypedStore<Session>>,
        policies: Arc<TypedStore<NamespacePolicy>>,
        registry: Arc<FrameworkRegistry>,
    ) {
        sessions.register_hook(Box::new(Self {
            policies,
            sessions: Arc::downgrade(sessions),
            registry,
        }));
    }

    fn effective_policy(&self, tenant: &str) -> NamespacePolicy {
        // No policy means no restrictions.
        self.policies
            .get(tenant, crate::resource::POLICY_NAME)
            .map_or_else(|| NamespacePolicy::unrestricted(tenant), |s| s.resource)
    }

    fn check_active_cap(&self, session: &Session, policy: &NamespacePolicy) -> Result<()> {
        let Some(cap) = policy.spec.limits.max_active_sessions else {
            return Ok(());
        };
        let Some(sessions) = self.sessions.upgrade() else {
            return Ok(());
        };
        let active = sessions
            .list(&session.tenant)
            .iter()
            .filter(|s| s.resource.status.phase.is_active())
            .count();
        if active as u64 >= u64::from(cap) {
            return Err(Error::policy(
                "ActiveSessionCap",
                format!(
                    "tenant {} already has {active} active sessions (cap {cap})",
                    session.tenant
                ),
            ));
        }
        Ok(())
    }
}

impl AdmissionHook<Session> for SessionValidator {
    fn validate_create(&self, new: &Session) -> Result<()> {
        if !is_valid_name(&new.id) {
            return Err(Error::shape(
                "InvalidName",
                format!("session id {:?} is not a valid DNS label", new.id),
            ));
        }
        if !is_valid_name(&new.tenant) {
            return Err(Error::shape(
                "InvalidName",
                format!("tenant {:?} is not a valid DNS label", new.tenant),
            ));
        }
        if !self.registry.contains(&new.spec.framework.framework_type) {
            return Err(Error::shape(
                "UnknownFramework",
                format!(
                    "framework type {:?} is not registered (available: {})",
                    new.spec.framework.framework_type,
                    self.registry.type_ids().join(", ")
                ),
            ));
        }
        // Framework config must parse under the strict schema even though
        // the full value stays opaque.
        ParsedFrameworkConfig::from_value(&new.spec.framework.config)?;

        // Clients do not supply status.
        if new.status.phase != Phase::Pending || !new.status.history.is_empty() {
            return Err(Error::shape(
                "StatusNotEmpty",
                "a new session may not carry a pre-populated status",
            ));
        }

        let snapshot = &new.spec.policy.tool_constraints;
        if let Some(tool) = snapshot.allowed.iter().find(|t| snapshot.blocked.contains(t)) {
            return Err(Error::shape(
                "ToolListsOverlap",
                format!("tool {tool:?} is both allowed and blocked in the session snapshot"),
            ));
        }

        let policy = self.effective_policy(&new.tenant);
        evaluate_against_policy(new, &policy)?;
        self.check_active_cap(new, &policy)
    }

    fn validate_update(&self, old: &Session, new: &Session) -> Result<()> {
        let changed = old.changed_immutable_fields(new);
        if !changed.is_empty() {
            return Err(Error::shape(
                "ImmutableField",
                format!("immutable fields changed: {}", changed.join(", ")),
            ));
        }
        // An approval verdict, once recorded, never changes.
        if old.spec.approval_decision.is_some()
            && old.spec.approval_decision != new.spec.approval_decision
        {
            return Err(Error::shape(
                "ApprovalDecisionSticky",
                "an approval decision cannot be changed or withdrawn",
            ));
        }
        validate_history_append_only(old, new)?;
        validate_phase_edge(old.status.phase, new.status.phase)
    }
}

/// Checks a session's policy snapshot and framework config against a
/// tenant policy. Shared between admission and the reconcilers.
///
/// # Errors
///
/// Returns `PolicyViolation` with a reason naming the first violated
/// constraint (`ModelNotAllowed`, `ModelBlocked`, `ToolNotAllowed`,
/// `ToolBlocked`, `BudgetExceeded`).
pub fn evaluate_against_policy(session: &Session, policy: &NamespacePolicy) -> Result<()> {
    let models = &policy.spec.models;
    let mut requested_models: Vec<&str> = session
        .spec
        .policy
        .model_constraints
        .allowed
        .iter()
        .map(String::as_str)
        .collect();
    // The model named in the framework config is a request like any other.
    let parsed = ParsedFrameworkConfig::from_value(&session.spec.framework.config)
        .unwrap_or_default();
    if let Some(model) = parsed.model.as_deref() {
        requested_models.push(model);
    }

    for model in &requested_models {
        if models.blocked.iter().any(|b| b == model) {
            return Err(Error::policy(
                "ModelBlocked",
                format!("model {model:?} is blocked by the tenant policy"),
            ));
        }
        if !models.allowed.is_empty() && !models.allowed.iter().any(|a| a == model) {
            return Err(Error::policy(
                "ModelNotAllowed",
                format!("model {model:?} is not in the tenant's allowed list"),
            ));
        }
    }

    let tools = &policy.spec.tools;
    for tool in &session.spec.policy.tool_constraints.allowed {
        if tools.blocked.contains(tool) {
            return Err(Error::policy(
                "ToolBlocked",
                format!("tool {tool:?} is blocked by the tenant policy"),
            ));
        }
        if !tools.allowed.is_empty() && !tools.allowed.contains(tool) {
            return Err(Error::policy(
                "ToolNotAllowed",
                format!("tool {tool:?} is not in the tenant's allowed list"),
            ));
        }
    }

    if let Some(remaining) = policy.remaining_budget() {
        let requested = session.spec.policy.model_constraints.budget;
        if requested > remaining {
            return Err(Error::policy(
                "BudgetExceeded",
                format!(
                    "session budget {requested} exceeds remaining allowance {remaining}"
                ),
            ));
        }
    }

    Ok(())
}

fn validate_history_append_only(old: &Session, new: &Session) -> Result<()> {
    let old_history = &old.status.history;
    let new_history = &new.status.history;

    if new_history.len() < old_history.len() {
        return Err(Error::shape(
            "HistoryShortened",
            format!(
                "history cannot be shortened (old: {}, new: {})",
                old_history.len(),
                new_history.len()
            ),
        ));
    }
    for (i, old_entry) in old_history.iter().enumerate() {
        let same = to_canonical_json(old_entry)? == to_canonical_json(&new_history[i])?;
        if !same {
            return Err(Error::shape(
                "HistoryMutated",
                format!("history entry {i} was modified"),
            ));
        }
    }
    Ok(())
}

fn validate_phase_edge(old: Phase, new: Phase) -> Result<()> {
    if old == new || old.can_transition_to(new) {
        return Ok(());
    }
    let reason = if old.is_terminal() {
        "TerminalPhaseSticky"
    } else {
        "InvalidTransition"
    };
    Err(Error::shape(
        reason,
        format!("phase transition {old} -> {new} is not allowed"),
    ))
}
