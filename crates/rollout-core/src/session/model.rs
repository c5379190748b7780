//! Rollout session data model.
//!
//! A `RolloutSession` is the orchestrator's record of one rollout attempt.
//! It is opened with outcome `Pending` when the target spec is activated and
//! becomes terminal once any other outcome is recorded. The control plane
//! stays the source of truth for what is actually running; sessions exist so
//! a rollout can be reasoned about, rolled back, and audited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::error::{Result, RolloutError};
use crate::spec::SpecChange;
use crate::types::{RolloutOutcome, ServiceRef, ServiceStatus, SpecId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutSession {
    pub id: Uuid,
    pub service: ServiceRef,
    /// Spec that was active before this rollout; the rollback target.
    pub previous_spec_id: SpecId,
    pub target_spec_id: SpecId,
    #[serde(default)]
    pub changes: Vec<SpecChange>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub outcome: RolloutOutcome,
    /// Why the session ended the way it did, for non-stable outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ServiceStatus>,
    #[serde(default)]
    pub rollback_attempted: bool,
    pub updated_at: DateTime<Utc>,
}

impl RolloutSession {
    /// Open a session in `Pending` state.
    pub fn open(
        id: Uuid,
        service: ServiceRef,
        previous_spec_id: SpecId,
        target_spec_id: SpecId,
        changes: Vec<SpecChange>,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::minutes(10));
        Self {
            id,
            service,
            previous_spec_id,
            target_spec_id,
            changes,
            started_at: now,
            deadline,
            outcome: RolloutOutcome::Pending,
            reason: None,
            last_status: None,
            rollback_attempted: false,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }

    /// Record a new outcome, enforcing the outcome transition rules.
    pub fn record(&mut self, outcome: RolloutOutcome, reason: Option<String>) -> Result<()> {
        if !self.outcome.can_transition_to(outcome) {
            return Err(RolloutError::InvalidTransition {
                from: self.outcome,
                to: outcome,
            });
        }
        self.outcome = outcome;
        if reason.is_some() {
            self.reason = reason;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn observe(&mut self, status: ServiceStatus) {
        self.last_status = Some(status);
        self.updated_at = Utc::now();
    }
}
