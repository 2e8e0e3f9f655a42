//! Caller identity.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// An authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    /// Provider username.
    pub username: String,
    /// Group memberships.
    pub groups: Vec<String>,
    /// Provider-stable user id.
    pub uid: String,
}

impl Subject {
    /// Whether the subject belongs to `group`.
    #[must_use]
    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }
}

/// Validates bearer tokens against the identity provider.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolves a bearer token to a subject.
    ///
    /// # Errors
    ///
    /// Returns `AuthN` for unknown, expired, or malformed tokens.
    async fn verify(&self, token: &str) -> Result<Subject>;
}

/// Token verifier backed by a static token table.
///
/// Used in tests and development; production deployments wire a real
/// OIDC-backed implementation at the gateway.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: RwLock<HashMap<String, Subject>>,
}

impl StaticTokenVerifier {
    /// Creates an empty verifier.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a token for a subject.
    pub fn insert(&self, token: &str, subject: Subject) {
        self.tokens
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(token.to_string(), subject);
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Subject> {
        self.tokens
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(token)
            .cloned()
            .ok_or_else(|| Error::authn("InvalidToken", "bearer token is not recognized"))
    }
}
