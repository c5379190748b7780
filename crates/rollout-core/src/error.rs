use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::control_plane::ControlPlaneError;
use crate::types::{RolloutOutcome, ServiceRef, ServiceStatus, SpecId};

#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("invalid service reference '{0}': expected <cluster>/<service>")]
    InvalidServiceRef(String),

    #[error("invalid rollout outcome: {0}")]
    InvalidOutcome(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("container '{container}' not found in spec {spec_id}")]
    ContainerNotFound { container: String, spec_id: SpecId },

    #[error("invalid change: {0}")]
    InvalidChange(String),

    #[error("spec registration failed: {0}")]
    Registration(String),

    #[error("update rejected for {service}: {reason}")]
    UpdateRejected { service: ServiceRef, reason: String },

    #[error("rollout already in progress for {service} (session {session})")]
    RolloutInProgress { service: ServiceRef, session: Uuid },

    #[error("primary deployment missing for {0}")]
    PrimaryDeploymentMissing(ServiceRef),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: RolloutOutcome,
        to: RolloutOutcome,
    },

    #[error("no timed-out rollout to roll back for {0}")]
    NothingToRollBack(ServiceRef),

    #[error("{service} is now running {active}, not {target}; not rolling back over it")]
    RollbackSuperseded {
        service: ServiceRef,
        target: SpecId,
        active: SpecId,
    },

    #[error("session journal at {0} is held by another rollout")]
    JournalBusy(String),

    #[error("control plane: {0}")]
    ControlPlane(#[from] ControlPlaneError),

    #[error("{context}")]
    Rollout {
        context: Box<RolloutContext>,
        #[source]
        source: Box<RolloutError>,
    },

    #[error("session db error: {0}")]
    SessionDb(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RolloutError {
    /// Attach rollout context to an error raised mid-rollout.
    pub fn with_context(self, context: RolloutContext) -> Self {
        match self {
            already @ RolloutError::Rollout { .. } => already,
            other => RolloutError::Rollout {
                context: Box::new(context),
                source: Box::new(other),
            },
        }
    }

    /// The underlying error with any rollout context peeled off.
    pub fn inner(&self) -> &RolloutError {
        match self {
            RolloutError::Rollout { source, .. } => source.inner(),
            other => other,
        }
    }

    pub fn context(&self) -> Option<&RolloutContext> {
        match self {
            RolloutError::Rollout { context, .. } => Some(context),
            _ => None,
        }
    }
}

/// Everything needed to diagnose a failed rollout without re-querying the cluster.
#[derive(Debug, Clone, PartialEq)]
pub struct RolloutContext {
    pub service: ServiceRef,
    pub target_spec_id: Option<SpecId>,
    pub previous_spec_id: Option<SpecId>,
    pub last_status: Option<ServiceStatus>,
}

impl RolloutContext {
    pub fn new(service: ServiceRef) -> Self {
        Self {
            service,
            target_spec_id: None,
            previous_spec_id: None,
            last_status: None,
        }
    }
}

impl fmt::Display for RolloutContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rollout of {} failed", self.service)?;
        let show = |id: &Option<SpecId>| {
            id.as_ref()
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into())
        };
        write!(
            f,
            " (target {}, previous {}",
            show(&self.target_spec_id),
            show(&self.previous_spec_id)
        )?;
        if let Some(st) = &self.last_status {
            write!(
                f,
                ", last seen {}/{} running, {} pending",
                st.running_count, st.desired_count, st.pending_count
            )?;
        }
        f.write_str(")")
    }
}

pub type Result<T> = std::result::Result<T, RolloutError>;
