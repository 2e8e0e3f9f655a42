//! Control-plane error taxonomy.
//!
//! Every fallible surface in the control plane classifies its failures into
//! one of the kinds below. The kind decides how callers react: admission
//! errors surface synchronously, `Transient` errors requeue with backoff,
//! and non-retryable reconcile errors transition the session to `Failed`.
//!
//! Errors carry a machine-readable `reason` token (for example
//! `HistoryShortened`) alongside the human message so that tests and
//! clients can match on behavior without parsing prose.

use thiserror::Error;

/// Classification of a control-plane failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Credential missing or invalid.
    AuthN,
    /// Identity lacks permission for the requested operation.
    AuthZ,
    /// Request or spec fails schema validation.
    ShapeInvalid,
    /// Spec violates the tenant's policy.
    PolicyViolation,
    /// Optimistic-concurrency failure or name clash.
    Conflict,
    /// Resource or tenant absent.
    NotFound,
    /// Per-tenant quota exceeded.
    RateLimited,
    /// Upstream I/O failure; retryable.
    Transient,
    /// Programmer error; not retryable, pages an operator.
    Fatal,
}

impl ErrorKind {
    /// Whether a reconciler should retry after this failure.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Stable machine token for the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthN => "AuthN",
            Self::AuthZ => "AuthZ",
            Self::ShapeInvalid => "ShapeInvalid",
            Self::PolicyViolation => "PolicyViolation",
            Self::Conflict => "Conflict",
            Self::NotFound => "NotFound",
            Self::RateLimited => "RateLimited",
            Self::Transient => "Transient",
            Self::Fatal => "Fatal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified control-plane error.
///
/// `reason` is a stable token suitable for matching (`PolicyViolation`
/// errors use reasons like `ModelBlocked` or `BudgetExceeded`); `message`
/// is free-form detail for humans and audit entries.
#[derive(Debug, Clone, Error)]
#[error("{kind}/{reason}: {message}")]
pub struct Error {
    kind: ErrorKind,
    reason: String,
    message: String,
}

impl Error {
    /// Creates an error with the given kind, reason token, and message.
    pub fn new(kind: ErrorKind, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// Credential missing or invalid.
    pub fn authn(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthN, reason, message)
    }

    /// Identity lacks permission.
    pub fn authz(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthZ, reason, message)
    }

    /// Schema violation.
    pub fn shape(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ShapeInvalid, reason, message)
    }

    /// Tenant policy violation.
    pub fn policy(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PolicyViolation, reason, message)
    }

    /// Version-token or name conflict.
    pub fn conflict(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, reason, message)
    }

    /// Resource absent.
    pub fn not_found(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, reason, message)
    }

    /// Quota exceeded.
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, "RateLimited", message)
    }

    /// Retryable upstream failure.
    pub fn transient(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, reason, message)
    }

    /// Programmer error.
    pub fn fatal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, reason, message)
    }

    /// The error's kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The stable reason token.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// The human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Result alias for control-plane operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
