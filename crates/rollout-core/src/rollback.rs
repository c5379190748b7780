//! Reverting a timed-out rollout to the spec that was active before it.
//!
//! A session gets exactly one rollback attempt. The rollback itself is a
//! forced activation of `previous_spec_id` followed by a stability watch;
//! if that watch also fails the session ends `Failed` and nothing further is
//! attempted automatically.

use crate::control_plane::ControlPlane;
use crate::error::{Result, RolloutError};
use crate::events::{Observers, RolloutEvent};
use crate::initiator;
use crate::session::RolloutSession;
use crate::types::RolloutOutcome;
use crate::watcher::{Deadline, StabilityWatcher, WatchOutcome, WatchSettings};

pub struct RollbackManager<'a> {
    plane: &'a dyn ControlPlane,
    settings: WatchSettings,
    observers: &'a Observers,
}

impl<'a> RollbackManager<'a> {
    pub fn new(plane: &'a dyn ControlPlane, settings: WatchSettings, observers: &'a Observers) -> Self {
        Self {
            plane,
            settings,
            observers,
        }
    }

    /// Roll `session` back to its previous spec.
    ///
    /// Only a `TimedOut` session that has not been rolled back before is
    /// accepted. On return the session is `RolledBack` or `Failed`; the
    /// outcome, not the `Result`, says whether the service was restored.
    pub async fn roll_back(&self, session: &mut RolloutSession, deadline: Deadline) -> Result<()> {
        if session.outcome != RolloutOutcome::TimedOut || session.rollback_attempted {
            return Err(RolloutError::InvalidTransition {
                from: session.outcome,
                to: RolloutOutcome::RolledBack,
            });
        }
        session.rollback_attempted = true;
        tracing::warn!(
            service = %session.service,
            session = %session.id,
            from = %session.target_spec_id,
            to = %session.previous_spec_id,
            "rolling back"
        );
        self.observers.emit(RolloutEvent::RolloutRollingBack {
            session: session.clone(),
        });

        if let Err(e) = initiator::activate(self.plane, &session.service, &session.previous_spec_id).await {
            return self.fail(session, format!("rollback activation failed: {e}"));
        }

        let watcher = StabilityWatcher::new(self.plane, self.settings, self.observers);
        match watcher
            .watch(&session.service, session.id, Some(&session.previous_spec_id), deadline)
            .await
        {
            Ok(report) => {
                if let Some(status) = report.last_status {
                    session.observe(status);
                }
                match report.outcome {
                    WatchOutcome::Stable => {
                        session.record(RolloutOutcome::RolledBack, None)?;
                        tracing::info!(
                            service = %session.service,
                            spec_id = %session.previous_spec_id,
                            polls = report.polls,
                            "rollback stable"
                        );
                        self.observers.emit(RolloutEvent::RolloutRolledBack {
                            session: session.clone(),
                        });
                        Ok(())
                    }
                    WatchOutcome::TimedOut => {
                        let reason = format!(
                            "rollback to {} did not stabilize within {}s",
                            session.previous_spec_id,
                            self.settings.timeout.as_secs()
                        );
                        self.fail(session, reason)
                    }
                }
            }
            Err(e) => self.fail(session, format!("rollback watch failed: {e}")),
        }
    }

    fn fail(&self, session: &mut RolloutSession, reason: String) -> Result<()> {
        tracing::error!(
            service = %session.service,
            session = %session.id,
            previous = %session.previous_spec_id,
            target = %session.target_spec_id,
            reason = %reason,
            "rollback failed, manual intervention required"
        );
        session.record(RolloutOutcome::Failed, Some(reason))?;
        self.observers.emit(RolloutEvent::RolloutFailed {
            session: session.clone(),
        });
        Ok(())
    }
}
