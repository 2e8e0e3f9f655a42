//! NamespacePolicy admission.
//!
//! Rejects config-invalid policies before they can take effect: allowed
//! and blocked lists must be disjoint for both models and tools, the
//! budget reset day must land on a day every month has, rate limits must
//! sit in their documented ranges, notification sinks must use http(s)
//! and filter on known event names, and API keys must already be one-way
//! verifiers — a policy write carrying a plaintext key is a bug in the
//! caller and is refused.

use crate::error::{Error, Result};
use crate::notify::NotificationEvent;
use crate::resource::policy::NamespacePolicy;
use crate::resource::session::is_valid_name;
use crate::store::AdmissionHook;

/// Bounds on `webhookAuth.rateLimit.requestsPerMinute`.
const RPM_RANGE: std::ops::RangeInclusive<u32> = 1..=1000;
/// Bounds on `webhookAuth.rateLimit.burstSize`.
const BURST_RANGE: std::ops::RangeInclusive<u32> = 1..=100;
/// Bounds on `models.budget.resetDay`.
const RESET_DAY_RANGE: std::ops::RangeInclusive<u8> = 1..=28;

/// Validates NamespacePolicy writes.
#[derive(Debug, Default, Clone, Copy)]
pub struct PolicyValidator;

impl PolicyValidator {
    /// Full shape validation of a policy document.
    ///
    /// Also used by the policy reconciler as defense in depth: a policy
    /// that somehow bypassed admission is flagged `ConfigValid=False`
    /// instead of silently enforced.
    ///
    /// # Errors
    ///
    /// Returns `ShapeInvalid` naming the first violated constraint.
    pub fn validate(policy: &NamespacePolicy) -> Result<()> {
        if !is_valid_name(&policy.tenant) {
            return Err(Error::shape(
                "InvalidName",
                format!("tenant {:?} is not a valid DNS label", policy.tenant),
            ));
        }

        check_disjoint("models", &policy.spec.models.allowed, &policy.spec.models.blocked)?;
        check_disjoint("tools", &policy.spec.tools.allowed, &policy.spec.tools.blocked)?;

        if let Some(budget) = &policy.spec.models.budget {
            if !RESET_DAY_RANGE.contains(&budget.reset_day) {
                return Err(Error::shape(
                    "ResetDayOutOfRange",
                    format!("budget resetDay {} is outside 1..=28", budget.reset_day),
                ));
            }
        }

        let rate = &policy.spec.webhook_auth.rate_limit;
        if !RPM_RANGE.contains(&rate.requests_per_minute) {
            return Err(Error::shape(
                "RateLimitOutOfRange",
                format!(
                    "requestsPerMinute {} is outside 1..=1000",
                    rate.requests_per_minute
                ),
            ));
        }
        if !BURST_RANGE.contains(&rate.burst_size) {
            return Err(Error::shape(
                "RateLimitOutOfRange",
                format!("burstSize {} is outside 1..=100", rate.burst_size),
            ));
        }

        for (source, verifier) in &policy.spec.webhook_auth.api_keys {
            if !is_sha256_verifier(verifier) {
                return Err(Error::shape(
                    "ApiKeyNotVerifier",
                    format!(
                        "webhookAuth.apiKeys.{source} must be a sha256:<hex> verifier, \
                         never a plaintext key"
                    ),
                ));
            }
        }

        for sink in &policy.spec.notifications.webhooks {
            let scheme_ok =
                sink.url.starts_with("https://") || sink.url.starts_with("http://");
            if !scheme_ok {
                return Err(Error::shape(
                    "SinkSchemeInvalid",
                    format!("notification sink {:?} must use http or https", sink.url),
                ));
            }
            if let Some(event) = sink.events.iter().find(|e| !NotificationEvent::is_valid_name(e))
            {
                return Err(Error::shape(
                    "UnknownNotificationEvent",
                    format!("notification sink {:?} filters on unknown event {event:?}", sink.url),
                ));
            }
        }

        Ok(())
    }
}

impl AdmissionHook<NamespacePolicy> for PolicyValidator {
    fn validate_create(&self, new: &NamespacePolicy) -> Result<()> {
        Self::validate(new)
    }

    fn validate_update(&self, _old: &NamespacePolicy, new: &NamespacePolicy) -> Result<()> {
        Self::validate(new)
    }
}

fn check_disjoint(section: &str, allowed: &[String], blocked: &[String]) -> Result<()> {
    if let Some(overlap) = allowed.iter().find(|a| blocked.contains(a)) {
        return Err(Error::shape(
            "AllowBlockOverlap",
            format!("{section}: {overlap:?} cannot be both allowed and blocked"),
        ));
    }
    Ok(())
}

fn is_sha256_verifier(value: &str) -> bool {
    value
        .strip_prefix("sha256:")
        .is_some_and(|hex| hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::budget::BudgetAmount;
    use crate::resource::policy::{BudgetSpec, Currency, NotificationSink, RateLimitSpec};

    fn base_policy() -> NamespacePolicy {
        NamespacePolicy::unrestricted("team-alpha")
    }

    #[test]
    fn unrestricted_policy_is_valid() {
        PolicyValidator::validate(&base_policy()).unwrap();
    }

    #[test]
    fn overlapping_model_lists_are_rejected() {
        let mut policy = base_policy();
        policy.spec.models.allowed = vec!["claude-3-sonnet".into(), "claude-3-haiku".into()];
        policy.spec.models.blocked = vec!["claude-3-haiku".into()];
        let err = PolicyValidator::validate(&policy).unwrap_err();
        assert_eq!(err.reason(), "AllowBlockOverlap");
    }

    #[test]
    fn overlapping_tool_lists_are_rejected() {
        let mut policy = base_policy();
        policy.spec.tools.allowed = vec!["editor".into()];
        policy.spec.tools.blocked = vec!["editor".into()];
        assert_eq!(
            PolicyValidator::validate(&policy).unwrap_err().reason(),
            "AllowBlockOverlap"
        );
    }

    #[test]
    fn reset_day_must_fit_every_month() {
        let mut policy = base_policy();
        policy.spec.models.budget = Some(BudgetSpec {
            monthly: BudgetAmount::parse("100.00").unwrap(),
            currency: Currency::USD,
            reset_day: 29,
        });
        assert_eq!(
            PolicyValidator::validate(&policy).unwrap_err().reason(),
            "ResetDayOutOfRange"
        );
    }

    #[test]
    fn rate_limit_ranges_are_enforced() {
        let mut policy = base_policy();
        policy.spec.webhook_auth.rate_limit = RateLimitSpec {
            requests_per_minute: 0,
            burst_size: 10,
        };
        assert_eq!(
            PolicyValidator::validate(&policy).unwrap_err().reason(),
            "RateLimitOutOfRange"
        );

        policy.spec.webhook_auth.rate_limit = RateLimitSpec {
            requests_per_minute: 60,
            burst_size: 101,
        };
        assert_eq!(
            PolicyValidator::validate(&policy).unwrap_err().reason(),
            "RateLimitOutOfRange"
        );
    }

    #[test]
    fn plaintext_api_keys_are_refused() {
        let mut policy = base_policy();
        policy
            .spec
            .webhook_auth
            .api_keys
            .insert("github".into(), "super-secret-key".into());
        assert_eq!(
            PolicyValidator::validate(&policy).unwrap_err().reason(),
            "ApiKeyNotVerifier"
        );

        policy.spec.webhook_auth.api_keys.insert(
            "github".into(),
            format!("sha256:{}", "ab".repeat(32)),
        );
        PolicyValidator::validate(&policy).unwrap();
    }

    #[test]
    fn sink_urls_must_be_http() {
        let mut policy = base_policy();
        policy.spec.notifications.webhooks = vec![NotificationSink {
            url: "ftp://example.com/hook".into(),
            events: vec![],
        }];
        assert_eq!(
            PolicyValidator::validate(&policy).unwrap_err().reason(),
            "SinkSchemeInvalid"
        );
    }

    #[test]
    fn sink_event_filters_use_the_closed_set() {
        let mut policy = base_policy();
        policy.spec.notifications.webhooks = vec![NotificationSink {
            url: "https://example.com/hook".into(),
            events: vec!["session.created".into(), "session.imagined".into()],
        }];
        assert_eq!(
            PolicyValidator::validate(&policy).unwrap_err().reason(),
            "UnknownNotificationEvent"
        );
    }
}
