use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::RolloutError;

// ---------------------------------------------------------------------------
// ServiceRef
// ---------------------------------------------------------------------------

/// Cluster + service identifier. Textual form is `cluster/service`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceRef {
    pub cluster: String,
    pub service: String,
}

impl ServiceRef {
    pub fn new(cluster: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            service: service.into(),
        }
    }
}

impl fmt::Display for ServiceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.service)
    }
}

impl std::str::FromStr for ServiceRef {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RolloutError::InvalidServiceRef(s.to_string());
        let (cluster, service) = s.split_once('/').ok_or_else(invalid)?;
        let valid_part = |p: &str| {
            !p.is_empty()
                && p
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        };
        if !valid_part(cluster) || !valid_part(service) {
            return Err(invalid());
        }
        Ok(Self::new(cluster, service))
    }
}

// ---------------------------------------------------------------------------
// SpecId
// ---------------------------------------------------------------------------

/// Opaque, store-assigned identifier of a registered workload spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpecId(String);

impl SpecId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SpecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SpecId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Service status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    Active,
    Draining,
    Inactive,
}

impl ServiceState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceState::Active => "ACTIVE",
            ServiceState::Draining => "DRAINING",
            ServiceState::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// The deployment the control plane treats as authoritative.
    Primary,
    /// A superseded deployment still draining tasks.
    Active,
    Inactive,
}

/// One deployment of a service. Superseded whenever a new rollout starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub status: DeploymentStatus,
    pub spec_id: SpecId,
    pub running_count: u32,
    pub desired_count: u32,
    pub pending_count: u32,
    pub started_at: DateTime<Utc>,
}

impl DeploymentRecord {
    /// Running matches desired with nothing pending.
    pub fn is_converged(&self) -> bool {
        self.running_count == self.desired_count && self.pending_count == 0
    }
}

/// Externally owned snapshot of a service, fetched fresh on every poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub service: ServiceRef,
    pub status: ServiceState,
    pub desired_count: u32,
    pub running_count: u32,
    pub pending_count: u32,
    pub active_spec_id: SpecId,
    #[serde(default)]
    pub deployments: Vec<DeploymentRecord>,
}

impl ServiceStatus {
    pub fn primary(&self) -> Option<&DeploymentRecord> {
        self.deployments
            .iter()
            .find(|d| d.status == DeploymentStatus::Primary)
    }
}

// ---------------------------------------------------------------------------
// RolloutOutcome
// ---------------------------------------------------------------------------

/// Outcome of a rollout session.
///
/// Transitions: `Pending → Stable | TimedOut | RolledBack | Failed`, and
/// `TimedOut → RolledBack | Failed` when an operator rolls back after a
/// timeout. `Pending` is the only non-terminal outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutOutcome {
    Pending,
    Stable,
    TimedOut,
    RolledBack,
    Failed,
}

impl RolloutOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutOutcome::Pending => "PENDING",
            RolloutOutcome::Stable => "STABLE",
            RolloutOutcome::TimedOut => "TIMED_OUT",
            RolloutOutcome::RolledBack => "ROLLED_BACK",
            RolloutOutcome::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, RolloutOutcome::Pending)
    }

    pub fn can_transition_to(self, next: RolloutOutcome) -> bool {
        use RolloutOutcome::*;
        matches!(
            (self, next),
            (Pending, Stable | TimedOut | RolledBack | Failed) | (TimedOut, RolledBack | Failed)
        )
    }
}

impl fmt::Display for RolloutOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RolloutOutcome {
    type Err = RolloutError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "PENDING" => Ok(RolloutOutcome::Pending),
            "STABLE" => Ok(RolloutOutcome::Stable),
            "TIMED_OUT" => Ok(RolloutOutcome::TimedOut),
            "ROLLED_BACK" => Ok(RolloutOutcome::RolledBack),
            "FAILED" => Ok(RolloutOutcome::Failed),
            _ => Err(RolloutError::InvalidOutcome(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_ref_parses_cluster_and_service() {
        let svc: ServiceRef = "vendor-cluster/vendor-api".parse().unwrap();
        assert_eq!(svc.cluster, "vendor-cluster");
        assert_eq!(svc.service, "vendor-api");
        assert_eq!(svc.to_string(), "vendor-cluster/vendor-api");
    }

    #[test]
    fn service_ref_rejects_malformed_input() {
        for bad in ["", "no-slash", "/svc", "cluster/", "a/b/c", "bad cluster/svc"] {
            assert!(
                matches!(
                    bad.parse::<ServiceRef>(),
                    Err(RolloutError::InvalidServiceRef(_))
                ),
                "expected '{bad}' to be rejected"
            );
        }
    }

    #[test]
    fn outcome_transitions() {
        use RolloutOutcome::*;
        assert!(Pending.can_transition_to(Stable));
        assert!(Pending.can_transition_to(Failed));
        assert!(TimedOut.can_transition_to(RolledBack));
        assert!(TimedOut.can_transition_to(Failed));
        assert!(!Stable.can_transition_to(RolledBack));
        assert!(!RolledBack.can_transition_to(Failed));
        assert!(!TimedOut.can_transition_to(Stable));
        assert!(!Pending.can_transition_to(Pending));
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!RolloutOutcome::Pending.is_terminal());
        assert!(RolloutOutcome::TimedOut.is_terminal());
        assert!(RolloutOutcome::Failed.is_terminal());
    }

    #[test]
    fn outcome_serializes_screaming_snake() {
        let json = serde_json::to_string(&RolloutOutcome::RolledBack).unwrap();
        assert_eq!(json, "\"ROLLED_BACK\"");
        assert_eq!(
            "timed-out".parse::<RolloutOutcome>().unwrap(),
            RolloutOutcome::TimedOut
        );
    }

    #[test]
    fn primary_lookup_ignores_draining_deployments() {
        let svc = ServiceRef::new("c", "s");
        let record = |id: &str, status, running| DeploymentRecord {
            id: id.into(),
            status,
            spec_id: SpecId::new(format!("fam:{id}")),
            running_count: running,
            desired_count: 2,
            pending_count: 0,
            started_at: Utc::now(),
        };
        let status = ServiceStatus {
            service: svc,
            status: ServiceState::Active,
            desired_count: 2,
            running_count: 3,
            pending_count: 0,
            active_spec_id: SpecId::new("fam:2"),
            deployments: vec![
                record("1", DeploymentStatus::Active, 1),
                record("2", DeploymentStatus::Primary, 2),
            ],
        };
        let primary = status.primary().unwrap();
        assert_eq!(primary.id, "2");
        assert!(primary.is_converged());
    }
}
