//! In-process orchestrator stand-in.
//!
//! Behaves like the real workload API at the interface level: idempotent
//! create by name, owner-conflict detection, status reads, delete, and
//! log retrieval. Tests drive execution by flipping workload states
//! explicitly.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{WorkloadApi, WorkloadSpec, WorkloadState, WorkloadStatus};
use crate::error::{Error, Result};
use crate::resource::session::WorkloadRef;

struct FakeWorkload {
    spec: WorkloadSpec,
    status: WorkloadStatus,
    logs: Vec<String>,
}

/// In-memory [`WorkloadApi`] implementation.
#[derive(Default)]
pub struct FakeOrchestrator {
    workloads: RwLock<HashMap<(String, String), FakeWorkload>>,
    /// When set, all calls fail `Transient`; simulates an outage.
    outage: std::sync::atomic::AtomicBool,
}

impl FakeOrchestrator {
    /// Creates an empty orchestrator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggles simulated unavailability.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_up(&self) -> Result<()> {
        if self.outage.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::transient("OrchestratorDown", "simulated outage"));
        }
        Ok(())
    }

    /// Drives a workload to a new state. Panics on unknown workloads —
    /// a test driving a workload it never created is broken.
    pub fn set_state(&self, tenant: &str, name: &str, state: WorkloadState) {
        let mut workloads = self
            .workloads
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let workload = workloads
            .get_mut(&(tenant.to_string(), name.to_string()))
            .unwrap_or_else(|| panic!("no workload {tenant}/{name}"));
        match &state {
            WorkloadState::Running => workload.status.started_at = Some(Utc::now()),
            WorkloadState::Succeeded | WorkloadState::Failed { .. } => {
                workload.status.finished_at = Some(Utc::now());
            }
            WorkloadState::Pending => {}
        }
        workload.status.state = state;
    }

    /// Appends a log line to a workload.
    pub fn push_log(&self, tenant: &str, name: &str, line: &str) {
        let mut workloads = self
            .workloads
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(workload) = workloads.get_mut(&(tenant.to_string(), name.to_string())) {
            workload.logs.push(line.to_string());
        }
    }

    /// Whether a workload exists.
    #[must_use]
    pub fn exists(&self, tenant: &str, name: &str) -> bool {
        self.workloads
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&(tenant.to_string(), name.to_string()))
    }

    /// Removes a workload out from under its session, simulating external
    /// deletion.
    pub fn vanish(&self, tenant: &str, name: &str) {
        self.workloads
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&(tenant.to_string(), name.to_string()));
    }

    /// The stored spec of a workload, for assertions.
    #[must_use]
    pub fn spec_of(&self, tenant: &str, name: &str) -> Option<WorkloadSpec> {
        self.workloads
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(tenant.to_string(), name.to_string()))
            .map(|w| w.spec.clone())
    }
}

#[async_trait]
impl WorkloadApi for FakeOrchestrator {
    async fn create(&self, spec: &WorkloadSpec) -> Result<WorkloadRef> {
        self.check_up()?;
        let key = (spec.tenant.clone(), spec.name.clone());
        let mut workloads = self
            .workloads
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(existing) = workloads.get(&key) {
            if existing.spec.owner == spec.owner {
                // Re-creating an existing workload is a no-op by name.
                return Ok(existing.status.workload_ref.clone());
            }
            return Err(Error::conflict(
                "WorkloadNameConflict",
                format!(
                    "workload {}/{} is owned by session {}",
                    spec.tenant, spec.name, existing.spec.owner.session_id
                ),
            ));
        }

        let workload_ref = WorkloadRef {
            name: spec.name.clone(),
            uid: Uuid::new_v4().to_string(),
        };
        workloads.insert(
            key,
            FakeWorkload {
                spec: spec.clone(),
                status: WorkloadStatus {
                    workload_ref: workload_ref.clone(),
                    state: WorkloadState::Pending,
                    started_at: None,
                    finished_at: None,
                },
                logs: Vec::new(),
            },
        );
        Ok(workload_ref)
    }

    async fn status(&self, tenant: &str, name: &str) -> Result<Option<WorkloadStatus>> {
        self.check_up()?;
        Ok(self
            .workloads
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(tenant.to_string(), name.to_string()))
            .map(|w| w.status.clone()))
    }

    async fn delete(&self, tenant: &str, name: &str) -> Result<bool> {
        self.check_up()?;
        Ok(self
            .workloads
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&(tenant.to_string(), name.to_string()))
            .is_some())
    }

    async fn logs(&self, tenant: &str, name: &str) -> Result<Vec<String>> {
        self.check_up()?;
        self.workloads
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(tenant.to_string(), name.to_string()))
            .map(|w| w.logs.clone())
            .ok_or_else(|| {
                Error::not_found("NoSuchWorkload", format!("workload {tenant}/{name} not found"))
            })
    }
}
