//! Declarative resource kinds and their field-level constraints.
//!
//! Two kinds exist: [`session::Session`] (one agentic execution) and
//! [`policy::NamespacePolicy`] (the per-tenant constraint contract).
//! Validation beyond field shape lives in [`crate::admission`].

pub mod budget;
pub mod policy;
pub mod retention;
pub mod session;

pub use budget::BudgetAmount;
pub use policy::{NamespacePolicy, PolicySpec, RateLimitSpec, POLICY_NAME};
pub use retention::RetentionPeriod;
pub use session::{
    ArtifactRef, Condition, ConditionStatus, HistoryEntry, Phase, ResourceUsage, Session,
    SessionSpec, SessionStatus, Trigger, WorkloadRef,
};
