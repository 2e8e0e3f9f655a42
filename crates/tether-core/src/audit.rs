//! Append-only audit log.
//!
//! Every authentication decision, admission denial, sweep deletion, and
//! reconciler fault writes one entry. Entries are never mutated; the only
//! removal path is retention pruning by the policy reconciler, and audit
//! logs carry the longest retention window of any record class.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of the audited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    /// The action was permitted and performed.
    Allow,
    /// The action was refused.
    Deny,
    /// The action faulted.
    Error,
}

/// One audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// When the action happened.
    pub timestamp: DateTime<Utc>,
    /// Tenant the action targeted.
    pub tenant: String,
    /// Session concerned, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Who acted: a username, `webhook:<source>`, or a controller name.
    pub actor: String,
    /// What was attempted, e.g. `session.create` or `retention.sweep`.
    pub action: String,
    /// The resource acted on.
    pub resource: String,
    /// How it went.
    pub outcome: AuditOutcome,
    /// Free-form detail.
    pub details: String,
    /// Trace id propagated from the originating request.
    pub trace_id: String,
}

/// In-process audit log.
///
/// Thread-safe; writers append, readers snapshot. Pruning removes only
/// entries older than the given cutoff and never reorders the rest.
#[derive(Default)]
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl AuditLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one entry.
    pub fn record(&self, entry: AuditEntry) {
        tracing::debug!(
            tenant = %entry.tenant,
            actor = %entry.actor,
            action = %entry.action,
            outcome = ?entry.outcome,
            trace_id = %entry.trace_id,
            "audit"
        );
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
    }

    /// Snapshot of all entries for a tenant, oldest first.
    #[must_use]
    pub fn for_tenant(&self, tenant: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .filter(|e| e.tenant == tenant)
            .cloned()
            .collect()
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes a tenant's entries older than `max_age` relative to `now`.
    /// Returns how many were pruned.
    pub fn prune(&self, tenant: &str, max_age: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - max_age;
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.tenant != tenant || e.timestamp >= cutoff);
        before - entries.len()
    }
}

/// Builder-ish constructor for the common cases.
impl AuditEntry {
    /// Creates an entry stamped `now`.
    #[must_use]
    pub fn now(
        tenant: &str,
        actor: &str,
        action: &str,
        resource: &str,
        outcome: AuditOutcome,
        trace_id: &str,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            tenant: tenant.to_string(),
            session_id: None,
            actor: actor.to_string(),
            action: action.to_string(),
            resource: resource.to_string(),
            outcome,
            details: String::new(),
            trace_id: trace_id.to_string(),
        }
    }

    /// Attaches a session id.
    #[must_use]
    pub fn session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Attaches detail text.
    #[must_use]
    pub fn detail(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    /// Attaches structured detail as compact JSON.
    #[must_use]
    pub fn detail_json(mut self, details: &Value) -> Self {
        self.details = details.to_string();
        self
    }
}
