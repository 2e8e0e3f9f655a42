//! Secret store interface.
//!
//! Framework credentials and webhook signature secrets are fetched by
//! opaque reference and never embedded in a Session spec. The store is
//! external; this module defines the interface the core consumes plus an
//! in-memory implementation for tests and development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{Error, Result};

/// Fetches secret material by opaque reference.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolves a secret reference like `tenants/team-alpha/webhooks/github`.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown references; `Transient` when the backing
    /// store is unreachable.
    async fn fetch(&self, reference: &str) -> Result<SecretString>;
}

/// In-memory secret store.
#[derive(Default)]
pub struct MemorySecretStore {
    secrets: RwLock<HashMap<String, SecretString>>,
}

impl MemorySecretStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a secret under a reference.
    pub fn insert(&self, reference: &str, secret: SecretString) {
        self.secrets
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(reference.to_string(), secret);
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn fetch(&self, reference: &str) -> Result<SecretString> {
        self.secrets
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(reference)
            .cloned()
            .ok_or_else(|| {
                Error::not_found("NoSuchSecret", format!("secret reference {reference:?} not found"))
            })
    }
}
