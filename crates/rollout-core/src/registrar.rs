use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::error::{Result, RolloutError};
use crate::spec::SpecDraft;
use crate::types::SpecId;

/// Register `draft` as a new immutable spec and return its id.
///
/// Nothing is active yet at this point, so a failure leaves no state to unwind.
pub async fn register(plane: &dyn ControlPlane, draft: &SpecDraft) -> Result<SpecId> {
    let leaked = draft.server_assigned_keys();
    if !leaked.is_empty() {
        return Err(RolloutError::Registration(format!(
            "draft carries server-assigned fields: {}",
            leaked.join(", ")
        )));
    }
    let spec = plane.register_spec(draft).await.map_err(|e| match e {
        ControlPlaneError::Transient(_) => RolloutError::ControlPlane(e),
        other => RolloutError::Registration(other.to_string()),
    })?;
    tracing::info!(family = %draft.family, spec_id = %spec.spec_id, "registered new spec");
    Ok(spec.spec_id)
}
