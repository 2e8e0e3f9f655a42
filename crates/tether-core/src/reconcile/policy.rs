//! The policy controller.
//!
//! Runs on every NamespacePolicy change and on a periodic tick. Each pass
//! re-validates the policy shape (defense in depth behind the admission
//! validator), marks live sessions that violate the current policy,
//! enforces retention, recomputes `status.usage`, and emits budget
//! threshold notifications.
//!
//! Policy changes never edit an existing Session's spec; the only effect
//! on sessions is lifecycle action — violation marking and retention
//! deletion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::admission::{evaluate_against_policy, PolicyValidator};
use crate::audit::{AuditEntry, AuditLog, AuditOutcome};
use crate::error::Result;
use crate::notify::{NotificationEvent, Outbox};
use crate::resource::budget::BudgetAmount;
use crate::resource::policy::{NamespacePolicy, PolicyUsage};
use crate::resource::session::{condition_types, ConditionStatus, Phase, Session};
use crate::resource::POLICY_NAME;
use crate::store::{TypedStore, WatchEvent};

use super::{Reconciler, Requeue, WorkQueue};

/// Percentage at which `budget.warning` fires.
const BUDGET_WARNING_PERCENT: u32 = 80;

/// Tuning knobs for the policy controller.
#[derive(Debug, Clone)]
pub struct PolicyReconcilerConfig {
    /// Periodic tick driving usage rollup and retention sweeps.
    pub tick_interval: Duration,
}

impl Default for PolicyReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
        }
    }
}

#[derive(Default, Clone, Copy)]
struct BudgetNotifyState {
    period_start: Option<DateTime<Utc>>,
    warned: bool,
    exceeded: bool,
}

/// Reconciles NamespacePolicies: usage, violations, retention.
pub struct PolicyReconciler {
    sessions: Arc<TypedStore<Session>>,
    policies: Arc<TypedStore<NamespacePolicy>>,
    audit: Arc<AuditLog>,
    outbox: Outbox,
    config: PolicyReconcilerConfig,
    notify_state: Mutex<HashMap<String, BudgetNotifyState>>,
}

impl PolicyReconciler {
    /// Creates the controller.
    #[must_use]
    pub fn new(
        sessions: Arc<TypedStore<Session>>,
        policies: Arc<TypedStore<NamespacePolicy>>,
        audit: Arc<AuditLog>,
        outbox: Outbox,
        config: PolicyReconcilerConfig,
    ) -> Self {
        Self {
            sessions,
            policies,
            audit,
            outbox,
            config,
            notify_state: Mutex::new(HashMap::new()),
        }
    }

    /// Wires the controller to its store: follows the policy watch stream
    /// and ticks every tenant periodically.
    pub fn spawn_watch(self: &Arc<Self>, queue: &Arc<WorkQueue<String>>) -> tokio::task::JoinHandle<()> {
        let mut watch = self.policies.watch();
        for stored in self.policies.list_all() {
            queue.enqueue(stored.resource.tenant.clone());
        }

        let reconciler = Arc::clone(self);
        let queue = Arc::clone(queue);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(reconciler.config.tick_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    event = watch.recv() => match event {
                        Ok(WatchEvent::Created(stored) | WatchEvent::Updated(stored)) => {
                            queue.enqueue(stored.resource.tenant.clone());
                        }
                        Ok(WatchEvent::Deleted(_)) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                            for stored in reconciler.policies.list_all() {
                                queue.enqueue(stored.resource.tenant.clone());
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tick.tick() => {
                        for stored in reconciler.policies.list_all() {
                            queue.enqueue(stored.resource.tenant.clone());
                        }
                    }
                }
            }
        })
    }

    /// Marks sessions violating the current policy as Failed. Returns the
    /// violation count.
    fn mark_violations(&self, policy: &NamespacePolicy) -> Result<u64> {
        let tenant = &policy.tenant;
        let mut violations = 0;
        for stored in self.sessions.list(tenant) {
            let session = &stored.resource;
            if session.status.phase.is_terminal() {
                continue;
            }
            let Err(violation) = evaluate_against_policy(session, policy) else {
                continue;
            };
            violations += 1;
            tracing::info!(
                tenant = %tenant,
                session = %session.id,
                reason = violation.reason(),
                "session violates updated policy"
            );
            self.audit.record(
                AuditEntry::now(
                    tenant,
                    "policy-reconciler",
                    "policy.enforce",
                    "Session",
                    AuditOutcome::Deny,
                    &session.trace_id,
                )
                .session(&session.id)
                .detail(violation.to_string()),
            );
            self.sessions.update_with(tenant, &session.id, |s| {
                if s.status.phase.is_terminal() {
                    return Ok(());
                }
                let now = Utc::now();
                s.status.set_condition(
                    condition_types::POLICY_VALIDATED,
                    ConditionStatus::False,
                    violation.reason(),
                    violation.message(),
                    now,
                );
                s.status
                    .transition_to(Phase::Failed, "PolicyViolation", violation.message(), now)
            })?;
            self.outbox.publish(
                tenant,
                NotificationEvent::SessionFailed,
                Some(&session.id),
                json!({ "reason": "PolicyViolation", "message": violation.message() }),
            );
        }
        Ok(violations)
    }

    /// Deletes terminal sessions past retention and unlinks expired
    /// artifact references. Audit entries record every deletion.
    fn enforce_retention(&self, policy: &NamespacePolicy, now: DateTime<Utc>) -> Result<()> {
        let tenant = &policy.tenant;

        if let Some(period) = policy.spec.retention.sessions {
            let max_age = period.as_duration();
            for stored in self.sessions.list(tenant) {
                let session = &stored.resource;
                if !session.status.phase.is_terminal() {
                    continue;
                }
                let reference = session.status.completion_time.unwrap_or(session.created_at);
                if now.signed_duration_since(reference) >= max_age {
                    self.sessions.delete(tenant, &session.id)?;
                    tracing::info!(
                        tenant = %tenant,
                        session = %session.id,
                        age_days = now.signed_duration_since(reference).num_days(),
                        "session swept by retention"
                    );
                    self.audit.record(
                        AuditEntry::now(
                            tenant,
                            "policy-reconciler",
                            "retention.sweep",
                            "Session",
                            AuditOutcome::Allow,
                            &session.trace_id,
                        )
                        .session(&session.id)
                        .detail(format!("deleted after retention {period}")),
                    );
                }
            }
        }

        if let Some(period) = policy.spec.retention.artifacts {
            let max_age = period.as_duration();
            for stored in self.sessions.list(tenant) {
                let session = &stored.resource;
                let expired: Vec<String> = session
                    .status
                    .artifacts
                    .iter()
                    .filter(|a| now.signed_duration_since(a.created_at) >= max_age)
                    .map(|a| a.name.clone())
                    .collect();
                if expired.is_empty() {
                    continue;
                }
                self.sessions.update_with(tenant, &session.id, |s| {
                    s.status
                        .artifacts
                        .retain(|a| now.signed_duration_since(a.created_at) < max_age);
                    Ok(())
                })?;
                self.audit.record(
                    AuditEntry::now(
                        tenant,
                        "policy-reconciler",
                        "retention.unlink-artifacts",
                        "Session",
                        AuditOutcome::Allow,
                        &session.trace_id,
                    )
                    .session(&session.id)
                    .detail_json(&json!({ "unlinked": expired })),
                );
            }
        }

        if let Some(period) = policy.spec.retention.audit_logs {
            self.audit.prune(tenant, period.as_duration(), now);
        }

        Ok(())
    }

    /// Recomputes the tenant's usage rollup.
    fn compute_usage(&self, policy: &NamespacePolicy, now: DateTime<Utc>) -> PolicyUsage {
        let mut usage = PolicyUsage::default();
        let period_start = policy.spec.models.budget.as_ref().map(|b| b.period_start(now));

        let mut spent_cents: u64 = 0;
        for stored in self.sessions.list(&policy.tenant) {
            let session = &stored.resource;
            usage.sessions.total += 1;
            if session.status.phase.is_active() {
                usage.sessions.active += 1;
            }
            if let (Some(period_start), Some(completed)) =
                (period_start, session.status.completion_time)
            {
                if completed >= period_start {
                    spent_cents = spent_cents.saturating_add(
                        session
                            .status
                            .resource_usage
                            .as_ref()
                            .map_or(0, |u| u.cost_cents),
                    );
                }
            }
        }

        usage.budget.current_period = BudgetAmount::from_cents(spent_cents);
        if let Some(budget) = &policy.spec.models.budget {
            usage.budget.percent_used = usage.budget.current_period.percent_of(budget.monthly);
        }
        usage
    }

    /// Emits `budget.warning` / `budget.exceeded` once each per period.
    fn notify_budget_thresholds(&self, policy: &NamespacePolicy, usage: &PolicyUsage, now: DateTime<Utc>) {
        let Some(budget) = &policy.spec.models.budget else {
            return;
        };
        let period_start = budget.period_start(now);
        let percent = usage.budget.percent_used;

        let mut states = self
            .notify_state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = states.entry(policy.tenant.clone()).or_default();
        if state.period_start != Some(period_start) {
            *state = BudgetNotifyState {
                period_start: Some(period_start),
                warned: false,
                exceeded: false,
            };
        }

        let data = json!({
            "percentUsed": percent,
            "currentPeriod": usage.budget.current_period,
            "monthly": budget.monthly,
        });
        if percent >= 100 && !state.exceeded {
            state.exceeded = true;
            self.outbox.publish(
                &policy.tenant,
                NotificationEvent::BudgetExceeded,
                None,
                data,
            );
        } else if percent >= BUDGET_WARNING_PERCENT && !state.warned {
            state.warned = true;
            self.outbox.publish(
                &policy.tenant,
                NotificationEvent::BudgetWarning,
                None,
                data,
            );
        }
    }
}

#[async_trait::async_trait]
impl Reconciler for PolicyReconciler {
    type Key = String;

    fn name(&self) -> &'static str {
        "policy-reconciler"
    }

    async fn reconcile(&self, tenant: &String) -> Result<Requeue> {
        let Some(stored) = self.policies.get(tenant, POLICY_NAME) else {
            return Ok(Requeue::No);
        };
        let policy = stored.resource;
        let now = Utc::now();

        // Defense in depth behind admission: a malformed policy is flagged,
        // never enforced. The condition write itself may be refused by the
        // same admission hook; enforcement still stops either way.
        if let Err(shape) = PolicyValidator::validate(&policy) {
            tracing::warn!(tenant = %tenant, error = %shape, "stored policy failed shape validation");
            let flagged = self.policies.update_with(tenant, POLICY_NAME, |p| {
                p.status.set_condition(
                    condition_types::CONFIG_VALID,
                    ConditionStatus::False,
                    shape.reason(),
                    shape.message(),
                    now,
                );
                Ok(())
            });
            if let Err(e) = flagged {
                tracing::debug!(tenant = %tenant, error = %e, "could not record ConfigValid=False");
            }
            return Ok(Requeue::No);
        }

        let violations = self.mark_violations(&policy)?;
        self.enforce_retention(&policy, now)?;
        let usage = self.compute_usage(&policy, now);
        self.notify_budget_thresholds(&policy, &usage, now);

        self.policies.update_with(tenant, POLICY_NAME, |p| {
            p.status.usage = usage.clone();
            p.status.set_condition(
                condition_types::CONFIG_VALID,
                ConditionStatus::True,
                "Valid",
                "policy is active and enforced",
                now,
            );
            if violations > 0 {
                p.status.set_condition(
                    condition_types::POLICY_VIOLATION,
                    ConditionStatus::True,
                    "SessionsViolate",
                    &format!("{violations} sessions violate the current policy"),
                    now,
                );
            } else {
                p.status.set_condition(
                    condition_types::POLICY_VIOLATION,
                    ConditionStatus::False,
                    "NoViolations",
                    "no sessions violate the current policy",
                    now,
                );
            }
            Ok(())
        })?;

        Ok(Requeue::No)
    }
}
