//! # tether-core
//!
//! Session lifecycle engine and policy enforcement plane for the tether
//! control plane: a multi-tenant system that turns authenticated external
//! events into declarative, auditable agentic sessions executed as
//! isolated workloads on a container orchestrator.
//!
//! ## Architecture
//!
//! - **Resources** ([`resource`]): the `Session` and `NamespacePolicy`
//!   declarative kinds, with append-only history and a fixed lifecycle DAG.
//! - **Store** ([`store`]): versioned, namespaced source of truth with
//!   compare-and-set writes, watch streams, and synchronous admission.
//! - **Admission** ([`admission`]): validators that reject invalid or
//!   policy-violating writes atomically.
//! - **Reconcilers** ([`reconcile`]): the session controller (workload
//!   lifecycle) and policy controller (usage, violations, retention),
//!   running on a deduplicating per-key work queue.
//! - **Workloads** ([`workload`]): the orchestrator interface and the
//!   hardened workload spec builder.
//! - **Periphery**: audit log ([`audit`]), identity/authorization
//!   ([`auth`]), secret references ([`secrets`]), notification outbox
//!   ([`notify`]).
//!
//! The HTTP ingress (webhooks, read API, runner callbacks) lives in the
//! `tether-gateway` crate on top of this one.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod admission;
pub mod audit;
pub mod auth;
pub mod backoff;
pub mod canonical;
pub mod error;
pub mod framework;
pub mod notify;
pub mod reconcile;
pub mod resource;
pub mod secrets;
pub mod store;
pub mod workload;

pub use error::{Error, ErrorKind, Result};

/// Re-export commonly used types at the crate root.
pub use resource::{NamespacePolicy, Phase, Session};
pub use store::{ResourceKey, Stored, TypedStore};
