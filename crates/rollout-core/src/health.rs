use serde::{Deserialize, Serialize};

use crate::control_plane::ControlPlane;
use crate::error::Result;
use crate::fetcher;
use crate::types::{ServiceRef, ServiceState, ServiceStatus, SpecId};

/// Read-only projection of a service's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub service: ServiceRef,
    pub status: ServiceState,
    pub running_count: u32,
    pub desired_count: u32,
    pub pending_count: u32,
    pub active_spec_id: SpecId,
    pub deployment_count: usize,
}

impl HealthReport {
    pub fn from_status(status: &ServiceStatus) -> Self {
        Self {
            service: status.service.clone(),
            status: status.status,
            running_count: status.running_count,
            desired_count: status.desired_count,
            pending_count: status.pending_count,
            active_spec_id: status.active_spec_id.clone(),
            deployment_count: status.deployments.len(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceState::Active
            && self.running_count >= self.desired_count
            && self.pending_count == 0
    }
}

pub async fn report(plane: &dyn ControlPlane, service: &ServiceRef) -> Result<HealthReport> {
    let status = fetcher::fetch_status(plane, service).await?;
    Ok(HealthReport::from_status(&status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{Convergence, MemoryControlPlane};
    use crate::spec::{ContainerDefinition, SpecDraft};

    #[tokio::test]
    async fn report_projects_counts_and_deployments() {
        let plane = MemoryControlPlane::new();
        let svc = ServiceRef::new("prod", "api");
        let draft = SpecDraft::new("api", vec![ContainerDefinition::new("api", "img:v1")]);
        let a = plane.seed_service(&svc, &draft, 2).unwrap();

        let healthy = report(&plane, &svc).await.unwrap();
        assert_eq!(healthy.active_spec_id, a);
        assert_eq!((healthy.running_count, healthy.desired_count), (2, 2));
        assert_eq!(healthy.deployment_count, 1);
        assert!(healthy.is_healthy());

        plane.set_convergence(&a, Convergence::Never);
        plane.set_active_spec(&svc, &a, true).await.unwrap();
        let degraded = report(&plane, &svc).await.unwrap();
        assert_eq!(degraded.deployment_count, 2);
        assert_eq!(degraded.pending_count, 2);
        assert!(!degraded.is_healthy());
    }
}
