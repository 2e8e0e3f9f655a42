//! Authorization decisions with a bounded TTL cache.
//!
//! Every read-API request asks whether the subject may perform a verb on
//! a resource in a tenant. Decisions may be cached for a few seconds,
//! keyed by the full `(subject, verb, resource, tenant)` tuple; membership
//! changes call [`CachedAuthorizer::invalidate_all`].
//!
//! The `system:admins` group short-circuits to allow-all before the
//! backing authorizer is consulted.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::identity::Subject;
use crate::error::Result;

/// Group whose members may do anything.
pub const SYSTEM_ADMIN_GROUP: &str = "system:admins";

/// Default decision cache TTL.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Hard cap on cached decisions.
const MAX_CACHE_ENTRIES: usize = 10_000;

/// Tenant permission level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read-only access.
    Viewer,
    /// Read plus create/stop/delete.
    Editor,
}

impl Permission {
    /// Verbs granted by this level.
    #[must_use]
    pub fn allows(self, verb: &str) -> bool {
        match self {
            Self::Viewer => matches!(verb, "get" | "list" | "watch"),
            Self::Editor => {
                matches!(verb, "get" | "list" | "watch" | "create" | "update" | "delete")
            }
        }
    }
}

/// Answers authorization questions.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Whether `subject` may perform `verb` on `resource` in `tenant`.
    ///
    /// # Errors
    ///
    /// Returns `Transient` when the authorization subsystem is
    /// unreachable; callers must fail closed.
    async fn allowed(&self, subject: &Subject, verb: &str, resource: &str, tenant: &str)
        -> Result<bool>;

    /// The subject's permission in a tenant, if any.
    ///
    /// # Errors
    ///
    /// Returns `Transient` when the authorization subsystem is
    /// unreachable.
    async fn permission(&self, subject: &Subject, tenant: &str) -> Result<Option<Permission>>;

    /// Tenants the subject may at least view.
    ///
    /// # Errors
    ///
    /// Returns `Transient` when the authorization subsystem is
    /// unreachable.
    async fn visible_tenants(&self, subject: &Subject) -> Result<Vec<(String, Permission)>>;
}

/// In-memory authorizer backed by explicit grants.
///
/// Grants follow the convention of the orchestrator's RBAC projection:
/// a subject holds `Viewer` or `Editor` per tenant, directly or through a
/// group.
#[derive(Default)]
pub struct StaticAuthorizer {
    // (principal, tenant) -> permission; principal is "user:<name>" or
    // "group:<name>".
    grants: RwLock<HashMap<(String, String), Permission>>,
}

impl StaticAuthorizer {
    /// Creates an authorizer with no grants.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Grants a user a permission in a tenant.
    pub fn grant_user(&self, username: &str, tenant: &str, permission: Permission) {
        self.grants
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((format!("user:{username}"), tenant.to_string()), permission);
    }

    /// Grants a group a permission in a tenant.
    pub fn grant_group(&self, group: &str, tenant: &str, permission: Permission) {
        self.grants
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert((format!("group:{group}"), tenant.to_string()), permission);
    }

    fn lookup(&self, subject: &Subject, tenant: &str) -> Option<Permission> {
        let grants = self
            .grants
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut best = grants
            .get(&(format!("user:{}", subject.username), tenant.to_string()))
            .copied();
        for group in &subject.groups {
            let from_group = grants
                .get(&(format!("group:{group}"), tenant.to_string()))
                .copied();
            best = match (best, from_group) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
        }
        best
    }

    fn tenants(&self, subject: &Subject) -> Vec<(String, Permission)> {
        let grants = self
            .grants
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut principals = vec![format!("user:{}", subject.username)];
        principals.extend(subject.groups.iter().map(|g| format!("group:{g}")));

        let mut best: HashMap<String, Permission> = HashMap::new();
        for ((principal, tenant), permission) in grants.iter() {
            if principals.contains(principal) {
                best.entry(tenant.clone())
                    .and_modify(|p| *p = (*p).max(*permission))
                    .or_insert(*permission);
            }
        }
        let mut out: Vec<_> = best.into_iter().collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn allowed(
        &self,
        subject: &Subject,
        verb: &str,
        _resource: &str,
        tenant: &str,
    ) -> Result<bool> {
        if subject.in_group(SYSTEM_ADMIN_GROUP) {
            return Ok(true);
        }
        Ok(self.lookup(subject, tenant).is_some_and(|p| p.allows(verb)))
    }

    async fn permission(&self, subject: &Subject, tenant: &str) -> Result<Option<Permission>> {
        if subject.in_group(SYSTEM_ADMIN_GROUP) {
            return Ok(Some(Permission::Editor));
        }
        Ok(self.lookup(subject, tenant))
    }

    async fn visible_tenants(&self, subject: &Subject) -> Result<Vec<(String, Permission)>> {
        Ok(self.tenants(subject))
    }
}

/// Caches another authorizer's decisions briefly.
pub struct CachedAuthorizer<A> {
    inner: A,
    ttl: Duration,
    cache: RwLock<HashMap<(String, String, String, String), (bool, Instant)>>,
}

impl<A: Authorizer> CachedAuthorizer<A> {
    /// Wraps `inner` with the default TTL.
    #[must_use]
    pub fn new(inner: A) -> Self {
        Self::with_ttl(inner, DEFAULT_CACHE_TTL)
    }

    /// Wraps `inner` with an explicit TTL.
    #[must_use]
    pub fn with_ttl(inner: A, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drops all cached decisions. Called on tenant membership events.
    pub fn invalidate_all(&self) {
        self.cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    fn cache_key(subject: &Subject, verb: &str, resource: &str, tenant: &str) -> (String, String, String, String) {
        (
            subject.uid.clone(),
            verb.to_string(),
            resource.to_string(),
            tenant.to_string(),
        )
    }
}

#[async_trait]
impl<A: Authorizer> Authorizer for CachedAuthorizer<A> {
    async fn allowed(
        &self,
        subject: &Subject,
        verb: &str,
        resource: &str,
        tenant: &str,
    ) -> Result<bool> {
        let key = Self::cache_key(subject, verb, resource, tenant);
        {
            let cache = self
                .cache
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((decision, at)) = cache.get(&key) {
                if at.elapsed() < self.ttl {
                    return Ok(*decision);
                }
            }
        }

        let decision = self.inner.allowed(subject, verb, resource, tenant).await?;

        let mut cache = self
            .cache
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if cache.len() >= MAX_CACHE_ENTRIES {
            // Cheap eviction under pressure; entries are seconds-lived.
            cache.clear();
        }
        cache.insert(key, (decision, Instant::now()));
        Ok(decision)
    }

    async fn permission(&self, subject: &Subject, tenant: &str) -> Result<Option<Permission>> {
        self.inner.permission(subject, tenant).await
    }

    async fn visible_tenants(&self, subject: &Subject) -> Result<Vec<(String, Permission)>> {
        self.inner.visible_tenants(subject).await
    }
}
