//! Identity and authorization.
//!
//! Bearer tokens are validated by an external, OIDC-compatible provider;
//! authorization questions go to the orchestrator's authorization
//! subsystem. Both are consumed through traits here so the gateway can be
//! wired to real providers while tests use in-memory fakes.

mod authz;
mod identity;

pub use authz::{Authorizer, CachedAuthorizer, Permission, StaticAuthorizer, SYSTEM_ADMIN_GROUP};
pub use identity::{StaticTokenVerifier, Subject, TokenVerifier};
