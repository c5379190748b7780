use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::error::{Result, RolloutError};
use crate::spec::WorkloadSpec;
use crate::types::{ServiceRef, ServiceStatus};

/// Fetch the service's active spec and its live status. No side effects.
///
/// A missing service or spec is `NotFound`, which aborts a rollout before
/// anything has been mutated.
pub async fn fetch_current(
    plane: &dyn ControlPlane,
    service: &ServiceRef,
) -> Result<(WorkloadSpec, ServiceStatus)> {
    let status = fetch_status(plane, service).await?;
    let spec = plane.get_active_spec(service).await.map_err(not_found)?;
    if spec.spec_id != status.active_spec_id {
        tracing::debug!(
            service = %service,
            status_spec = %status.active_spec_id,
            active_spec = %spec.spec_id,
            "active spec changed between status and spec fetch"
        );
    }
    tracing::debug!(service = %service, spec_id = %spec.spec_id, "fetched current spec");
    Ok((spec, status))
}

/// Fetch the service's live status alone.
pub async fn fetch_status(plane: &dyn ControlPlane, service: &ServiceRef) -> Result<ServiceStatus> {
    plane.get_service(service).await.map_err(not_found)
}

fn not_found(e: ControlPlaneError) -> RolloutError {
    match e {
        ControlPlaneError::NotFound(what) => RolloutError::NotFound(what),
        other => RolloutError::ControlPlane(other),
    }
}
