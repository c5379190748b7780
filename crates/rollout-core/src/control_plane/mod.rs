//! The cluster control plane, as seen by the orchestrator.
//!
//! The control plane owns every piece of authoritative state: registered
//! specs, each service's active spec and its deployments. The orchestrator
//! only ever talks to it through [`ControlPlane`], which keeps the rollout
//! logic independent of where the cluster actually lives:
//!
//! - [`HttpControlPlane`] speaks JSON over HTTP to a real control plane
//! - [`MemoryControlPlane`] simulates one in-process for tests and dry runs
//! - [`RetryingControlPlane`] wraps either with bounded exponential backoff

pub mod http;
pub mod memory;
pub mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::spec::{SpecDraft, WorkloadSpec};
use crate::types::{ServiceRef, ServiceStatus, SpecId};

pub use http::HttpControlPlane;
pub use memory::{Convergence, MemoryControlPlane, Operation};
pub use retry::{RetryPolicy, RetryingControlPlane};

/// Errors reported by a control plane.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlPlaneError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("rejected: {0}")]
    Rejected(String),

    /// Network failures, timeouts, throttling and server-side errors.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

impl ControlPlaneError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ControlPlaneError::Transient(_))
    }
}

pub type PlaneResult<T> = std::result::Result<T, ControlPlaneError>;

/// Cluster control-plane API consumed by the orchestrator.
///
/// Implementations must not cache: every call reflects the store's current
/// state.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Live status of a service, including its deployment records.
    async fn get_service(&self, service: &ServiceRef) -> PlaneResult<ServiceStatus>;

    /// The spec the service is currently configured to run.
    async fn get_active_spec(&self, service: &ServiceRef) -> PlaneResult<WorkloadSpec>;

    /// Register a new immutable spec version. Never overwrites an existing one.
    async fn register_spec(&self, draft: &SpecDraft) -> PlaneResult<WorkloadSpec>;

    /// Point the service at `spec_id`. With `force_new_rollout` a new
    /// deployment starts even if `spec_id` is already active.
    async fn set_active_spec(
        &self,
        service: &ServiceRef,
        spec_id: &SpecId,
        force_new_rollout: bool,
    ) -> PlaneResult<()>;
}

#[async_trait]
impl<T: ControlPlane + ?Sized> ControlPlane for Arc<T> {
    async fn get_service(&self, service: &ServiceRef) -> PlaneResult<ServiceStatus> {
        (**self).get_service(service).await
    }

    async fn get_active_spec(&self, service: &ServiceRef) -> PlaneResult<WorkloadSpec> {
        (**self).get_active_spec(service).await
    }

    async fn register_spec(&self, draft: &SpecDraft) -> PlaneResult<WorkloadSpec> {
        (**self).register_spec(draft).await
    }

    async fn set_active_spec(
        &self,
        service: &ServiceRef,
        spec_id: &SpecId,
        force_new_rollout: bool,
    ) -> PlaneResult<()> {
        (**self)
            .set_active_spec(service, spec_id, force_new_rollout)
            .await
    }
}
