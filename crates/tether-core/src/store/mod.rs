//! The declarative resource store.
//!
//! The store is the single source of truth for the control plane: a
//! namespaced, versioned map of resources with optimistic concurrency,
//! synchronous admission hooks, and watch streams. No component keeps
//! authoritative state outside it.
//!
//! # Concurrency
//!
//! Writes are linearized per object by compare-and-set on a version token.
//! A transition (phase + conditions + history) is committed as one swap of
//! the whole resource under CAS, so it is atomic: it commits together or
//! not at all. Admission hooks run inside the write path before commit; a
//! hook rejection aborts the write with no side effects.

mod memory;

pub use memory::TypedStore;

use serde::{Deserialize, Serialize};

use crate::resource::policy::{NamespacePolicy, POLICY_NAME};
use crate::resource::session::Session;
use crate::error::Result;

/// A kind that can live in the store.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Kind name used in audit entries and errors.
    const KIND: &'static str;

    /// Owning tenant (orchestrator namespace).
    fn tenant(&self) -> &str;

    /// Name, unique within the tenant.
    fn name(&self) -> &str;

    /// The store key for this resource.
    fn key(&self) -> ResourceKey {
        ResourceKey {
            tenant: self.tenant().to_string(),
            name: self.name().to_string(),
        }
    }
}

impl Resource for Session {
    const KIND: &'static str = "Session";

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn name(&self) -> &str {
        &self.id
    }
}

impl Resource for NamespacePolicy {
    const KIND: &'static str = "NamespacePolicy";

    fn tenant(&self) -> &str {
        &self.tenant
    }

    fn name(&self) -> &str {
        POLICY_NAME
    }
}

/// Identity of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Owning tenant.
    pub tenant: String,
    /// Name within the tenant.
    pub name: String,
}

impl ResourceKey {
    /// Builds a key.
    pub fn new(tenant: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.tenant, self.name)
    }
}

/// A resource together with its version token.
#[derive(Debug, Clone)]
pub struct Stored<T> {
    /// The resource document.
    pub resource: T,
    /// Version token for compare-and-set updates.
    pub version: u64,
}

/// Change notification emitted by the store's watch stream.
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// A resource was created.
    Created(Stored<T>),
    /// A resource was updated (spec or status).
    Updated(Stored<T>),
    /// A resource was deleted.
    Deleted(ResourceKey),
}

impl<T: Resource> WatchEvent<T> {
    /// The key of the affected resource.
    #[must_use]
    pub fn key(&self) -> ResourceKey {
        match self {
            Self::Created(stored) | Self::Updated(stored) => stored.resource.key(),
            Self::Deleted(key) => key.clone(),
        }
    }
}

/// Synchronous admission hook invoked inside the write path.
///
/// Hooks must be idempotent, side-effect free, and fast; a returned error
/// rejects the write atomically.
pub trait AdmissionHook<T>: Send + Sync {
    /// Validates a create request.
    fn validate_create(&self, new: &T) -> Result<()>;

    /// Validates an update request against the currently stored object.
    fn validate_update(&self, old: &T, new: &T) -> Result<()>;
}
