//! Stability watching.
//!
//! A rollout is stable when the service's `PRIMARY` deployment has every
//! desired task running and nothing pending, observed on
//! `stable_confirmations` consecutive polls. The watcher polls the control
//! plane at a fixed interval until that holds or the deadline passes.
//!
//! The deadline lives in a `watch` channel so a [`CancelHandle`] can pull it
//! in to "now"; the watcher wakes immediately and reports `TimedOut`.
//! All timing uses `tokio::time`, so tests can run on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::control_plane::{ControlPlane, ControlPlaneError};
use crate::error::{Result, RolloutError};
use crate::events::{Observers, RolloutEvent};
use crate::types::{ServiceRef, ServiceStatus, SpecId};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);
/// Shorter intervals are raised to this so a zero never turns into a busy loop.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
    /// Consecutive converged polls required before declaring stability.
    pub stable_confirmations: u32,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            stable_confirmations: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Deadline / cancellation
// ---------------------------------------------------------------------------

/// Moves a running watch's deadline. Cloneable; all clones share one deadline.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Instant>>,
}

impl CancelHandle {
    /// Expire the deadline now. The watcher reports `TimedOut` on its next wake.
    pub fn cancel(&self) {
        self.tx.send_replace(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct Deadline {
    rx: watch::Receiver<Instant>,
}

impl Deadline {
    pub fn at(&self) -> Instant {
        *self.rx.borrow()
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at()
    }

    /// Sleep until `wake`, returning early if the deadline is moved.
    async fn sleep_until(&mut self, wake: Instant) {
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            changed = self.rx.changed() => {
                if changed.is_err() {
                    // every handle dropped: the deadline can no longer move
                    tokio::time::sleep_until(wake).await;
                }
            }
        }
    }
}

/// A deadline `timeout` from now and the handle that can cut it short.
pub fn deadline(timeout: Duration) -> (CancelHandle, Deadline) {
    let (tx, rx) = watch::channel(Instant::now() + timeout);
    (CancelHandle { tx: Arc::new(tx) }, Deadline { rx })
}

// ---------------------------------------------------------------------------
// Watcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Stable,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct WatchReport {
    pub outcome: WatchOutcome,
    pub last_status: Option<ServiceStatus>,
    pub polls: u32,
}

pub struct StabilityWatcher<'a> {
    plane: &'a dyn ControlPlane,
    settings: WatchSettings,
    observers: &'a Observers,
}

impl<'a> StabilityWatcher<'a> {
    pub fn new(plane: &'a dyn ControlPlane, settings: WatchSettings, observers: &'a Observers) -> Self {
        let settings = WatchSettings {
            poll_interval: settings.poll_interval.max(MIN_POLL_INTERVAL),
            ..settings
        };
        Self {
            plane,
            settings,
            observers,
        }
    }

    pub fn settings(&self) -> WatchSettings {
        self.settings
    }

    /// Poll `service` until its primary deployment is stable or `deadline` passes.
    ///
    /// With `expected` set, the primary must also be running that spec; a
    /// primary still on an older spec counts as not yet stable. A poll that
    /// fails transiently is inconclusive and resets the confirmation streak.
    /// A missing primary deployment or an undecodable status is fatal.
    pub async fn watch(
        &self,
        service: &ServiceRef,
        session_id: Uuid,
        expected: Option<&SpecId>,
        mut deadline: Deadline,
    ) -> Result<WatchReport> {
        let required = self.settings.stable_confirmations.max(1);
        let mut polls = 0u32;
        let mut streak = 0u32;
        let mut last_status = None;

        loop {
            if deadline.is_expired() {
                return Ok(WatchReport {
                    outcome: WatchOutcome::TimedOut,
                    last_status,
                    polls,
                });
            }

            polls += 1;
            match self.plane.get_service(service).await {
                Ok(status) => {
                    let primary = status
                        .primary()
                        .ok_or_else(|| RolloutError::PrimaryDeploymentMissing(service.clone()))?;
                    let on_target = expected.map_or(true, |id| &primary.spec_id == id);
                    if on_target && primary.is_converged() {
                        streak += 1;
                    } else {
                        streak = 0;
                    }
                    self.observers.emit(RolloutEvent::RolloutProgress {
                        session_id,
                        service: service.clone(),
                        poll: polls,
                        running: primary.running_count,
                        desired: primary.desired_count,
                        pending: primary.pending_count,
                    });
                    last_status = Some(status);
                    if streak >= required {
                        return Ok(WatchReport {
                            outcome: WatchOutcome::Stable,
                            last_status,
                            polls,
                        });
                    }
                }
                Err(ControlPlaneError::NotFound(what)) => return Err(RolloutError::NotFound(what)),
                Err(e @ ControlPlaneError::Transient(_)) => {
                    tracing::warn!(service = %service, poll = polls, error = %e, "status poll inconclusive");
                    streak = 0;
                }
                Err(e) => return Err(RolloutError::ControlPlane(e)),
            }

            let now = Instant::now();
            let wake = (now + self.settings.poll_interval).min(deadline.at());
            if wake > now {
                deadline.sleep_until(wake).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{Convergence, MemoryControlPlane, Operation};
    use crate::spec::{ContainerDefinition, SpecDraft};

    fn seeded() -> (MemoryControlPlane, ServiceRef, SpecId) {
        let plane = MemoryControlPlane::new();
        let svc = ServiceRef::new("prod", "api");
        let draft = SpecDraft::new("api", vec![ContainerDefinition::new("api", "img:v1")]);
        let spec = plane.seed_service(&svc, &draft, 2).unwrap();
        (plane, svc, spec)
    }

    fn settings() -> WatchSettings {
        WatchSettings::default()
    }

    #[tokio::test(start_paused = true)]
    async fn converged_primary_is_stable_on_first_poll() {
        let (plane, svc, spec) = seeded();
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (_cancel, dl) = deadline(DEFAULT_TIMEOUT);

        let report = watcher.watch(&svc, Uuid::new_v4(), Some(&spec), dl).await.unwrap();
        assert_eq!(report.outcome, WatchOutcome::Stable);
        assert_eq!(report.polls, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aggregate_counts_do_not_count_as_stable() {
        // Old deployment still has 2 running, new primary has 0 running and 2
        // pending: service-wide running equals desired, but the primary is not done.
        let (plane, svc, spec) = seeded();
        plane.set_default_convergence(Convergence::Never);
        plane.set_active_spec(&svc, &spec, true).await.unwrap();
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (_cancel, dl) = deadline(Duration::from_secs(90));

        let start = Instant::now();
        let report = watcher.watch(&svc, Uuid::new_v4(), None, dl).await.unwrap();
        assert_eq!(report.outcome, WatchOutcome::TimedOut);
        // polls at 0s, 30s, 60s; the deadline lands at 90s
        assert_eq!(report.polls, 3);
        assert_eq!(start.elapsed(), Duration::from_secs(90));
        let last = report.last_status.unwrap();
        assert!(last.running_count >= last.desired_count);
    }

    #[tokio::test(start_paused = true)]
    async fn stable_needs_consecutive_confirmations() {
        let (plane, svc, spec) = seeded();
        // converged, flaps, then converged twice
        plane.set_convergence(&spec, Convergence::Script(vec![(2, 0), (1, 1), (2, 0), (2, 0)]));
        plane.set_active_spec(&svc, &spec, true).await.unwrap();
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(
            &plane,
            WatchSettings {
                stable_confirmations: 2,
                ..settings()
            },
            &observers,
        );
        let (_cancel, dl) = deadline(DEFAULT_TIMEOUT);

        let report = watcher.watch(&svc, Uuid::new_v4(), Some(&spec), dl).await.unwrap();
        assert_eq!(report.outcome, WatchOutcome::Stable);
        assert_eq!(report.polls, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn primary_on_wrong_spec_is_not_stable() {
        let (plane, svc, _spec) = seeded();
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (_cancel, dl) = deadline(Duration::from_secs(45));

        let report = watcher
            .watch(&svc, Uuid::new_v4(), Some(&SpecId::new("api:7")), dl)
            .await
            .unwrap();
        assert_eq!(report.outcome, WatchOutcome::TimedOut);
        assert_eq!(report.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_primary_fails_fast() {
        let (plane, svc, spec) = seeded();
        plane.drop_primary(&svc);
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (_cancel, dl) = deadline(DEFAULT_TIMEOUT);

        let start = Instant::now();
        let err = watcher
            .watch(&svc, Uuid::new_v4(), Some(&spec), dl)
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::PrimaryDeploymentMissing(s) if s == svc));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_poll_failure_is_inconclusive() {
        let (plane, svc, spec) = seeded();
        plane.fail_next(
            Operation::GetService,
            ControlPlaneError::Transient("503".into()),
        );
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (_cancel, dl) = deadline(DEFAULT_TIMEOUT);

        let report = watcher.watch(&svc, Uuid::new_v4(), Some(&spec), dl).await.unwrap();
        assert_eq!(report.outcome, WatchOutcome::Stable);
        assert_eq!(report.polls, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn undecodable_status_fails_the_watch() {
        let (plane, svc, spec) = seeded();
        plane.fail_next(
            Operation::GetService,
            ControlPlaneError::Decode("missing field `deployments`".into()),
        );
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (_cancel, dl) = deadline(Duration::from_secs(120));

        let start = Instant::now();
        let err = watcher
            .watch(&svc, Uuid::new_v4(), Some(&spec), dl)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RolloutError::ControlPlane(ControlPlaneError::Decode(_))
        ));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(plane.poll_count(&svc), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn partially_running_primary_polls_until_the_deadline() {
        let plane = MemoryControlPlane::new();
        let svc = ServiceRef::new("prod", "api");
        let draft = SpecDraft::new("api", vec![ContainerDefinition::new("api", "img:v1")]);
        let spec = plane.seed_service(&svc, &draft, 3).unwrap();
        plane.set_convergence(&spec, Convergence::Script(vec![(2, 1)]));
        plane.set_active_spec(&svc, &spec, true).await.unwrap();
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (_cancel, dl) = deadline(Duration::from_secs(120));

        let start = Instant::now();
        let report = watcher.watch(&svc, Uuid::new_v4(), Some(&spec), dl).await.unwrap();
        assert_eq!(report.outcome, WatchOutcome::TimedOut);
        // polls at 0s, 30s, 60s, 90s; the deadline lands at 120s
        assert_eq!(report.polls, 4);
        assert_eq!(start.elapsed(), Duration::from_secs(120));
        let primary = report.last_status.as_ref().and_then(|s| s.primary()).cloned().unwrap();
        assert_eq!(
            (primary.running_count, primary.desired_count, primary.pending_count),
            (2, 3, 1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_is_raised_to_the_floor() {
        let (plane, svc, spec) = seeded();
        plane.set_convergence(&spec, Convergence::Never);
        plane.set_active_spec(&svc, &spec, true).await.unwrap();
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(
            &plane,
            WatchSettings {
                poll_interval: Duration::ZERO,
                ..settings()
            },
            &observers,
        );
        assert_eq!(watcher.settings().poll_interval, MIN_POLL_INTERVAL);
        let (_cancel, dl) = deadline(Duration::from_secs(5));

        let report = watcher.watch(&svc, Uuid::new_v4(), Some(&spec), dl).await.unwrap();
        assert_eq!(report.outcome, WatchOutcome::TimedOut);
        // one poll per second: 0s through 4s
        assert_eq!(report.polls, 5);
        assert_eq!(plane.poll_count(&svc), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_cuts_the_wait_short() {
        let (plane, svc, spec) = seeded();
        plane.set_convergence(&spec, Convergence::Never);
        plane.set_active_spec(&svc, &spec, true).await.unwrap();
        let observers = Observers::new();
        let watcher = StabilityWatcher::new(&plane, settings(), &observers);
        let (cancel, dl) = deadline(DEFAULT_TIMEOUT);

        let start = Instant::now();
        let canceller = async {
            tokio::time::sleep(Duration::from_secs(45)).await;
            cancel.cancel();
        };
        let (report, ()) = tokio::join!(
            watcher.watch(&svc, Uuid::new_v4(), Some(&spec), dl),
            canceller
        );
        let report = report.unwrap();
        assert_eq!(report.outcome, WatchOutcome::TimedOut);
        assert_eq!(report.polls, 2);
        assert_eq!(start.elapsed(), Duration::from_secs(45));
    }
}
