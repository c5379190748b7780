use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::error::{Result, RolloutError};
use crate::types::{ServiceRef, SpecId};

/// Point `service` at `spec_id`, always forcing a fresh deployment so an
/// update to an already-active spec is never silently skipped.
pub async fn activate(plane: &dyn ControlPlane, service: &ServiceRef, spec_id: &SpecId) -> Result<()> {
    plane
        .set_active_spec(service, spec_id, true)
        .await
        .map_err(|e| match e {
            ControlPlaneError::Transient(_) => RolloutError::ControlPlane(e),
            other => RolloutError::UpdateRejected {
                service: service.clone(),
                reason: other.to_string(),
            },
        })?;
    tracing::info!(service = %service, spec_id = %spec_id, "activated spec, new deployment forced");
    Ok(())
}
