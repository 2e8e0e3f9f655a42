//! The NamespacePolicy resource.
//!
//! One per tenant, name fixed to `policy`. It is the tenant's contract
//! with the control plane: which models and tools sessions may use, the
//! monthly spend ceiling, retention windows, webhook credentials (stored
//! as verifiers), and outbound notification sinks.

use chrono::{DateTime, Datelike, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::resource::budget::BudgetAmount;
use crate::resource::retention::RetentionPeriod;
use crate::resource::session::Condition;

/// The fixed name of every NamespacePolicy.
pub const POLICY_NAME: &str = "policy";

/// Supported budget currencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    /// United States dollars.
    USD,
}

impl Default for Currency {
    fn default() -> Self {
        Self::USD
    }
}

/// Monthly spend ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetSpec {
    /// Ceiling per budget period.
    pub monthly: BudgetAmount,
    /// Billing currency.
    #[serde(default)]
    pub currency: Currency,
    /// Day of month the period resets, 1..=28.
    #[serde(default = "default_reset_day")]
    pub reset_day: u8,
}

const fn default_reset_day() -> u8 {
    1
}

impl BudgetSpec {
    /// Start of the budget period containing `now`.
    ///
    /// The period boundary is midnight UTC on `reset_day`; a `now` earlier
    /// in the month than the reset day belongs to the previous period.
    #[must_use]
    pub fn period_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let day = u32::from(self.reset_day.clamp(1, 28));
        let (mut year, mut month) = (now.year(), now.month());
        if now.day() < day {
            if month == 1 {
                year -= 1;
                month = 12;
            } else {
                month -= 1;
            }
        }
        // Day is clamped to 28, so this date always exists.
        Utc.with_ymd_and_hms(year, month, day, 0, 0, 0)
            .single()
            .unwrap_or(now)
    }
}

/// Model allow/block lists and budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelsPolicy {
    /// Models sessions may request. Empty means unrestricted.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Models sessions must not use. Disjoint from `allowed`.
    #[serde(default)]
    pub blocked: Vec<String>,
    /// Spend ceiling; absent means unlimited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSpec>,
}

/// Tool allow/block lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsPolicy {
    /// Tools sessions may request. Empty means unrestricted.
    #[serde(default)]
    pub allowed: Vec<String>,
    /// Tools sessions must not use. Disjoint from `allowed`.
    #[serde(default)]
    pub blocked: Vec<String>,
}

/// Retention windows per record class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSpec {
    /// Terminal sessions older than this are swept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions: Option<RetentionPeriod>,
    /// Artifact references older than this are unlinked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<RetentionPeriod>,
    /// Audit entries older than this are pruned. Longest window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_logs: Option<RetentionPeriod>,
}

impl Default for RetentionSpec {
    fn default() -> Self {
        Self {
            sessions: None,
            artifacts: None,
            audit_logs: None,
        }
    }
}

/// Per-tenant webhook rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    /// Sustained request rate, 1..=1000.
    pub requests_per_minute: u32,
    /// Instantaneous burst allowance, 1..=100.
    pub burst_size: u32,
}

impl Default for RateLimitSpec {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst_size: 10,
        }
    }
}

/// Inbound webhook authentication material.
///
/// API keys are persisted as one-way verifiers (`sha256:<hex>` of the key),
/// never as the key itself; signature secrets live in the secret store and
/// are referenced, not embedded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuthSpec {
    /// Source id -> `sha256:<hex>` verifier of the API key.
    #[serde(default)]
    pub api_keys: BTreeMap<String, String>,
    /// Source id -> secret-store reference for signature verification.
    #[serde(default)]
    pub signature_secret_refs: BTreeMap<String, String>,
    /// Rate limit applied per `(tenant, source)`.
    #[serde(default)]
    pub rate_limit: RateLimitSpec,
}

/// One outbound notification sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSink {
    /// Destination URL, scheme http or https.
    pub url: String,
    /// Events to deliver; empty means all.
    #[serde(default)]
    pub events: Vec<String>,
}

/// Outbound notification configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationsSpec {
    /// Callback sinks.
    #[serde(default)]
    pub webhooks: Vec<NotificationSink>,
}

/// Optional hard limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsSpec {
    /// Cap on sessions in phase Pending or Running; absent means uncapped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_active_sessions: Option<u32>,
    /// Hold every session in Pending until an editor approves it.
    #[serde(default)]
    pub require_approval: bool,
}

/// Desired state of a NamespacePolicy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    /// Model constraints.
    #[serde(default)]
    pub models: ModelsPolicy,
    /// Tool constraints.
    #[serde(default)]
    pub tools: ToolsPolicy,
    /// Retention windows.
    #[serde(default)]
    pub retention: RetentionSpec,
    /// Inbound webhook authentication.
    #[serde(default)]
    pub webhook_auth: WebhookAuthSpec,
    /// Outbound notifications.
    #[serde(default)]
    pub notifications: NotificationsSpec,
    /// Hard limits.
    #[serde(default)]
    pub limits: LimitsSpec,
}

/// Rolling budget usage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetUsage {
    /// Spend accumulated in the current period.
    #[serde(default)]
    pub current_period: BudgetAmount,
    /// `current_period` as an integer percentage of the ceiling.
    #[serde(default)]
    pub percent_used: u32,
}

/// Rolling session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounts {
    /// Sessions in phase Pending or Running.
    #[serde(default)]
    pub active: u64,
    /// All sessions in the tenant.
    #[serde(default)]
    pub total: u64,
}

/// Usage rollup computed by the policy reconciler.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyUsage {
    /// Budget consumption.
    #[serde(default)]
    pub budget: BudgetUsage,
    /// Session counters.
    #[serde(default)]
    pub sessions: SessionCounts,
}

/// Observed state of a NamespacePolicy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyStatus {
    /// Usage rollup.
    #[serde(default)]
    pub usage: PolicyUsage,
    /// Conditions, including `ConfigValid` and `PolicyViolation`.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl PolicyStatus {
    /// Sets a condition, merging by type.
    pub fn set_condition(
        &mut self,
        condition_type: &str,
        status: crate::resource::session::ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        crate::resource::session::upsert_condition(
            &mut self.conditions,
            condition_type,
            status,
            reason,
            message,
            now,
        );
    }
}

/// A tenant's NamespacePolicy resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamespacePolicy {
    /// Owning tenant.
    pub tenant: String,
    /// Desired state.
    pub spec: PolicySpec,
    /// Observed state.
    #[serde(default)]
    pub status: PolicyStatus,
    /// Creation timestamp, set by the store.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NamespacePolicy {
    /// An unrestricted policy for tenants that have not configured one.
    #[must_use]
    pub fn unrestricted(tenant: &str) -> Self {
        Self {
            tenant: tenant.to_string(),
            spec: PolicySpec::default(),
            status: PolicyStatus::default(),
            created_at: Utc::now(),
        }
    }

    /// Remaining budget allowance for the current period, if a budget is
    /// configured.
    #[must_use]
    pub fn remaining_budget(&self) -> Option<BudgetAmount> {
        self.spec
            .models
            .budget
            .as_ref()
            .map(|b| b.monthly.saturating_sub(self.status.usage.budget.current_period))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn period_start_respects_reset_day() {
        let budget = BudgetSpec {
            monthly: BudgetAmount::from_cents(10_000),
            currency: Currency::USD,
            reset_day: 15,
        };

        let after = Utc.with_ymd_and_hms(2026, 3, 20, 12, 0, 0).unwrap();
        assert_eq!(
            budget.period_start(after),
            Utc.with_ymd_and_hms(2026, 3, 15, 0, 0, 0).unwrap()
        );

        let before = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            budget.period_start(before),
            Utc.with_ymd_and_hms(2026, 2, 15, 0, 0, 0).unwrap()
        );

        let january = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap();
        assert_eq!(
            budget.period_start(january),
            Utc.with_ymd_and_hms(2025, 12, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn remaining_budget_subtracts_current_period() {
        let mut policy = NamespacePolicy::unrestricted("team-alpha");
        assert_eq!(policy.remaining_budget(), None);

        policy.spec.models.budget = Some(BudgetSpec {
            monthly: BudgetAmount::parse("100.00").unwrap(),
            currency: Currency::USD,
            reset_day: 1,
        });
        policy.status.usage.budget.current_period = BudgetAmount::parse("40.00").unwrap();
        assert_eq!(
            policy.remaining_budget(),
            Some(BudgetAmount::parse("60.00").unwrap())
        );

        policy.status.usage.budget.current_period = BudgetAmount::parse("140.00").unwrap();
        assert_eq!(policy.remaining_budget(), Some(BudgetAmount::ZERO));
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let mut policy = NamespacePolicy::unrestricted("team-alpha");
        policy.spec.webhook_auth.rate_limit = RateLimitSpec {
            requests_per_minute: 120,
            burst_size: 20,
        };
        let v = serde_json::to_value(&policy).unwrap();
        assert_eq!(v["spec"]["webhookAuth"]["rateLimit"]["requestsPerMinute"], 120);
        assert_eq!(v["spec"]["webhookAuth"]["rateLimit"]["burstSize"], 20);
    }
}
