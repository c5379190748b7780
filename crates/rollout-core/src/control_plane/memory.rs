//! In-process control-plane simulator.
//!
//! [`MemoryControlPlane`] behaves like a small container scheduler: specs are
//! registered with a per-family revision counter, activating a spec starts a
//! new `PRIMARY` deployment and demotes the old one, and each status poll
//! advances the primary deployment according to its spec's [`Convergence`].
//!
//! ## Limitations
//!
//! - **Single process**: state lives in a mutex and is lost on exit
//! - **Poll-driven**: deployments only progress when `get_service` is called

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;

use super::{ControlPlane, ControlPlaneError, PlaneResult};
use crate::spec::{SpecDraft, WorkloadSpec};
use crate::types::{
    DeploymentRecord, DeploymentStatus, ServiceRef, ServiceState, ServiceStatus, SpecId,
};

/// How a deployment of a given spec behaves under polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence {
    /// All tasks are pending for the first `n` polls, then all are running.
    PendingFor(u32),
    /// Tasks never leave pending.
    Never,
    /// Explicit `(running, pending)` per poll; the last entry repeats.
    Script(Vec<(u32, u32)>),
}

impl Default for Convergence {
    fn default() -> Self {
        Convergence::PendingFor(0)
    }
}

impl Convergence {
    fn counts(&self, poll: u32, desired: u32) -> (u32, u32) {
        match self {
            Convergence::PendingFor(n) if poll > *n => (desired, 0),
            Convergence::PendingFor(_) | Convergence::Never => (0, desired),
            Convergence::Script(steps) => {
                let idx = (poll.saturating_sub(1) as usize).min(steps.len().saturating_sub(1));
                steps.get(idx).copied().unwrap_or((0, desired))
            }
        }
    }
}

/// Control-plane operation, used to target injected faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetService,
    GetActiveSpec,
    RegisterSpec,
    SetActiveSpec,
}

/// A recorded `set_active_spec` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub service: ServiceRef,
    pub spec_id: SpecId,
    pub force_new_rollout: bool,
}

struct SimDeployment {
    record: DeploymentRecord,
    polls: u32,
}

struct SimService {
    state: ServiceState,
    desired: u32,
    active_spec: SpecId,
    deployments: Vec<SimDeployment>,
    polls: u32,
}

#[derive(Default)]
struct Inner {
    specs: BTreeMap<SpecId, WorkloadSpec>,
    revisions: HashMap<String, u64>,
    services: HashMap<ServiceRef, SimService>,
    convergence: HashMap<SpecId, Convergence>,
    default_convergence: Convergence,
    rejected: HashSet<SpecId>,
    faults: VecDeque<(Operation, ControlPlaneError)>,
    activations: Vec<Activation>,
    deployment_seq: u64,
}

impl Inner {
    fn take_fault(&mut self, op: Operation) -> PlaneResult<()> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, err)) => Err(err),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn register(&mut self, draft: &SpecDraft) -> PlaneResult<WorkloadSpec> {
        if draft.family.trim().is_empty() {
            return Err(ControlPlaneError::Rejected("family must not be empty".into()));
        }
        if draft.containers.is_empty() {
            return Err(ControlPlaneError::Rejected(
                "spec must define at least one container".into(),
            ));
        }
        let leaked = draft.server_assigned_keys();
        if !leaked.is_empty() {
            return Err(ControlPlaneError::Rejected(format!(
                "server-assigned fields are not accepted: {}",
                leaked.join(", ")
            )));
        }
        let revision = self.revisions.entry(draft.family.clone()).or_insert(0);
        *revision += 1;
        let spec = WorkloadSpec {
            spec_id: SpecId::new(format!("{}:{}", draft.family, revision)),
            revision: *revision,
            status: Some("ACTIVE".into()),
            compatibilities: Vec::new(),
            requires_attributes: Vec::new(),
            registered_at: Some(Utc::now()),
            registered_by: Some("memory-control-plane".into()),
            draft: draft.clone(),
        };
        self.specs.insert(spec.spec_id.clone(), spec.clone());
        Ok(spec)
    }

    fn next_deployment(&mut self, spec_id: &SpecId, desired: u32) -> SimDeployment {
        self.deployment_seq += 1;
        SimDeployment {
            record: DeploymentRecord {
                id: format!("dep-{}", self.deployment_seq),
                status: DeploymentStatus::Primary,
                spec_id: spec_id.clone(),
                running_count: 0,
                desired_count: desired,
                pending_count: desired,
                started_at: Utc::now(),
            },
            polls: 0,
        }
    }
}

/// In-memory [`ControlPlane`] for tests and local dry runs.
#[derive(Default)]
pub struct MemoryControlPlane {
    inner: Mutex<Inner>,
}

impl MemoryControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `draft` and create `service` running it, fully converged.
    pub fn seed_service(
        &self,
        service: &ServiceRef,
        draft: &SpecDraft,
        desired: u32,
    ) -> PlaneResult<SpecId> {
        let mut inner = self.lock();
        let spec = inner.register(draft)?;
        let mut dep = inner.next_deployment(&spec.spec_id, desired);
        dep.record.running_count = desired;
        dep.record.pending_count = 0;
        inner.services.insert(
            service.clone(),
            SimService {
                state: ServiceState::Active,
                desired,
                active_spec: spec.spec_id.clone(),
                deployments: vec![dep],
                polls: 0,
            },
        );
        Ok(spec.spec_id)
    }

    /// Behaviour applied to deployments of specs without an explicit override.
    pub fn set_default_convergence(&self, convergence: Convergence) {
        self.lock().default_convergence = convergence;
    }

    /// Behaviour of deployments running `spec_id`.
    pub fn set_convergence(&self, spec_id: &SpecId, convergence: Convergence) {
        self.lock().convergence.insert(spec_id.clone(), convergence);
    }

    /// Behaviour of deployments of the next spec registered in `family`.
    pub fn set_next_convergence(&self, family: &str, convergence: Convergence) -> SpecId {
        let mut inner = self.lock();
        let next = inner.revisions.get(family).copied().unwrap_or(0) + 1;
        let id = SpecId::new(format!("{family}:{next}"));
        inner.convergence.insert(id.clone(), convergence);
        id
    }

    /// Make `set_active_spec` reject `spec_id`.
    pub fn reject_activation_of(&self, spec_id: &SpecId) {
        self.lock().rejected.insert(spec_id.clone());
    }

    /// Fail the next call to `op` with `err`.
    pub fn fail_next(&self, op: Operation, err: ControlPlaneError) {
        self.lock().faults.push_back((op, err));
    }

    /// Demote the service's primary deployment, as if the control plane lost track of it.
    pub fn drop_primary(&self, service: &ServiceRef) {
        if let Some(svc) = self.lock().services.get_mut(service) {
            for dep in &mut svc.deployments {
                if dep.record.status == DeploymentStatus::Primary {
                    dep.record.status = DeploymentStatus::Inactive;
                }
            }
        }
    }

    pub fn active_spec_id(&self, service: &ServiceRef) -> Option<SpecId> {
        self.lock()
            .services
            .get(service)
            .map(|s| s.active_spec.clone())
    }

    pub fn spec(&self, spec_id: &SpecId) -> Option<WorkloadSpec> {
        self.lock().specs.get(spec_id).cloned()
    }

    pub fn spec_count(&self) -> usize {
        self.lock().specs.len()
    }

    pub fn activations(&self) -> Vec<Activation> {
        self.lock().activations.clone()
    }

    /// Number of status polls served for `service`.
    pub fn poll_count(&self, service: &ServiceRef) -> u32 {
        self.lock()
            .services
            .get(service)
            .map(|s| s.polls)
            .unwrap_or(0)
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn get_service(&self, service: &ServiceRef) -> PlaneResult<ServiceStatus> {
        let mut inner = self.lock();
        inner.take_fault(Operation::GetService)?;
        let Inner {
            services,
            convergence,
            default_convergence,
            ..
        } = &mut *inner;
        let svc = services
            .get_mut(service)
            .ok_or_else(|| ControlPlaneError::NotFound(format!("service {service}")))?;
        svc.polls += 1;

        let desired = svc.desired;
        let mut primary_converged = false;
        for dep in &mut svc.deployments {
            if dep.record.status != DeploymentStatus::Primary {
                continue;
            }
            dep.polls += 1;
            let rule = convergence
                .get(&dep.record.spec_id)
                .unwrap_or(&*default_convergence);
            let (running, pending) = rule.counts(dep.polls, desired);
            dep.record.running_count = running;
            dep.record.pending_count = pending;
            primary_converged = dep.record.is_converged();
        }
        if primary_converged {
            // superseded deployments finish draining once the primary is healthy
            svc.deployments
                .retain(|d| d.record.status == DeploymentStatus::Primary);
        }

        Ok(ServiceStatus {
            service: service.clone(),
            status: svc.state,
            desired_count: desired,
            running_count: svc.deployments.iter().map(|d| d.record.running_count).sum(),
            pending_count: svc.deployments.iter().map(|d| d.record.pending_count).sum(),
            active_spec_id: svc.active_spec.clone(),
            deployments: svc.deployments.iter().map(|d| d.record.clone()).collect(),
        })
    }

    async fn get_active_spec(&self, service: &ServiceRef) -> PlaneResult<WorkloadSpec> {
        let mut inner = self.lock();
        inner.take_fault(Operation::GetActiveSpec)?;
        let active = inner
            .services
            .get(service)
            .map(|s| s.active_spec.clone())
            .ok_or_else(|| ControlPlaneError::NotFound(format!("service {service}")))?;
        inner
            .specs
            .get(&active)
            .cloned()
            .ok_or_else(|| ControlPlaneError::NotFound(format!("spec {active}")))
    }

    async fn register_spec(&self, draft: &SpecDraft) -> PlaneResult<WorkloadSpec> {
        let mut inner = self.lock();
        inner.take_fault(Operation::RegisterSpec)?;
        inner.register(draft)
    }

    async fn set_active_spec(
        &self,
        service: &ServiceRef,
        spec_id: &SpecId,
        force_new_rollout: bool,
    ) -> PlaneResult<()> {
        let mut inner = self.lock();
        inner.take_fault(Operation::SetActiveSpec)?;
        inner.activations.push(Activation {
            service: service.clone(),
            spec_id: spec_id.clone(),
            force_new_rollout,
        });
        if !inner.specs.contains_key(spec_id) {
            return Err(ControlPlaneError::Rejected(format!("unknown spec {spec_id}")));
        }
        if inner.rejected.contains(spec_id) {
            return Err(ControlPlaneError::Rejected(format!(
                "spec {spec_id} cannot be placed"
            )));
        }
        let (desired, unchanged) = match inner.services.get(service) {
            Some(svc) => (svc.desired, svc.active_spec == *spec_id),
            None => return Err(ControlPlaneError::NotFound(format!("service {service}"))),
        };
        if unchanged && !force_new_rollout {
            return Ok(());
        }
        let dep = inner.next_deployment(spec_id, desired);
        if let Some(svc) = inner.services.get_mut(service) {
            for old in &mut svc.deployments {
                if old.record.status == DeploymentStatus::Primary {
                    old.record.status = DeploymentStatus::Active;
                }
            }
            svc.deployments.push(dep);
            svc.active_spec = spec_id.clone();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
