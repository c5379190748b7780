//! Rollout orchestration.
//!
//! [`Orchestrator::rollout`] runs the whole pipeline for one service:
//! claim the service, fetch its active spec, apply the requested changes,
//! register the result, activate it, and watch until stable or timed out.
//! A timed-out rollout is rolled back once when `auto_rollback` is set, or
//! later through [`Orchestrator::rollback`].
//!
//! Errors before activation (bad input, unknown service, rejected draft)
//! return `Err` and leave nothing running. Once a session is open, timeouts
//! and failed rollbacks are outcomes on the returned session; only fatal
//! conditions during the watch still surface as `Err`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use uuid::Uuid;

use crate::control_plane::ControlPlane;
use crate::error::{Result, RolloutContext, RolloutError};
use crate::events::{Observers, RolloutEvent, RolloutObserver};
use crate::fetcher;
use crate::health::{self, HealthReport};
use crate::initiator;
use crate::registrar;
use crate::rollback::RollbackManager;
use crate::session::{RolloutSession, ServiceLease, ServiceLocks};
use crate::spec::{self, SpecChange};
use crate::types::{RolloutOutcome, ServiceRef, SpecId};
use crate::watcher::{self, CancelHandle, Deadline, StabilityWatcher, WatchOutcome, WatchSettings};

#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub service: ServiceRef,
    pub changes: Vec<SpecChange>,
    pub auto_rollback: bool,
}

/// Final state of a session plus a health snapshot taken right after it ended.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub session: RolloutSession,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
}

impl RolloutReport {
    pub fn outcome(&self) -> RolloutOutcome {
        self.session.outcome
    }
}

type InFlightMap = HashMap<ServiceRef, CancelHandle>;

#[derive(Clone)]
pub struct Orchestrator {
    plane: Arc<dyn ControlPlane>,
    settings: WatchSettings,
    locks: ServiceLocks,
    observers: Observers,
    in_flight: Arc<Mutex<InFlightMap>>,
}

impl Orchestrator {
    pub fn new(plane: Arc<dyn ControlPlane>, settings: WatchSettings) -> Self {
        Self {
            plane,
            settings,
            locks: ServiceLocks::new(),
            observers: Observers::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RolloutObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn settings(&self) -> WatchSettings {
        self.settings
    }

    pub fn locks(&self) -> &ServiceLocks {
        &self.locks
    }

    fn plane(&self) -> &dyn ControlPlane {
        self.plane.as_ref()
    }

    /// Expire the deadline of the watch running for `service`.
    ///
    /// Returns `false` when nothing is being watched for that service.
    pub fn cancel(&self, service: &ServiceRef) -> bool {
        match self.in_flight().get(service) {
            Some(handle) => {
                tracing::info!(service = %service, "cancelling rollout watch");
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Apply `changes` to the service's active spec and roll it out.
    pub async fn rollout(&self, request: RolloutRequest) -> Result<RolloutReport> {
        let RolloutRequest {
            service,
            changes,
            auto_rollback,
        } = request;
        let lease = self.locks.try_acquire(&service, Uuid::new_v4())?;
        let mut ctx = RolloutContext::new(service.clone());

        let (current, status) = fetcher::fetch_current(self.plane(), &service)
            .await
            .map_err(|e| e.with_context(ctx.clone()))?;
        ctx.previous_spec_id = Some(current.spec_id.clone());
        ctx.last_status = Some(status);

        let draft = spec::mutate(&current, &changes).map_err(|e| e.with_context(ctx.clone()))?;
        let target = registrar::register(self.plane(), &draft)
            .await
            .map_err(|e| e.with_context(ctx))?;

        let session = RolloutSession::open(
            lease.session_id(),
            service,
            current.spec_id,
            target,
            changes,
            self.settings.timeout,
        );
        self.drive(lease, session, auto_rollback).await
    }

    /// Roll the service out to an already-registered spec, or force a fresh
    /// deployment of its current spec when `spec_id` is `None`.
    pub async fn redeploy(
        &self,
        service: &ServiceRef,
        spec_id: Option<&SpecId>,
        auto_rollback: bool,
    ) -> Result<RolloutReport> {
        let lease = self.locks.try_acquire(service, Uuid::new_v4())?;
        let (current, _) = fetcher::fetch_current(self.plane(), service)
            .await
            .map_err(|e| e.with_context(RolloutContext::new(service.clone())))?;
        let target = spec_id.cloned().unwrap_or_else(|| current.spec_id.clone());

        let session = RolloutSession::open(
            lease.session_id(),
            service.clone(),
            current.spec_id,
            target,
            Vec::new(),
            self.settings.timeout,
        );
        self.drive(lease, session, auto_rollback).await
    }

    /// Roll a timed-out session back to its previous spec.
    ///
    /// Refused when the service has since moved off the session's target
    /// spec: the control plane's active spec wins over the session record.
    pub async fn rollback(&self, mut session: RolloutSession) -> Result<RolloutReport> {
        let _lease = self.locks.try_acquire(&session.service, session.id)?;
        if session.outcome != RolloutOutcome::TimedOut || session.rollback_attempted {
            return Err(RolloutError::NothingToRollBack(session.service.clone()));
        }
        let status = fetcher::fetch_status(self.plane(), &session.service)
            .await
            .map_err(|e| e.with_context(context_for(&session)))?;
        if status.active_spec_id != session.target_spec_id {
            return Err(RolloutError::RollbackSuperseded {
                service: session.service.clone(),
                target: session.target_spec_id.clone(),
                active: status.active_spec_id,
            });
        }
        let tracked = self.track(&session.service);
        self.roll_back(&mut session, tracked.deadline()).await?;
        let health = self.health_of(&session.service).await;
        Ok(RolloutReport { session, health })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        _lease: ServiceLease,
        mut session: RolloutSession,
        auto_rollback: bool,
    ) -> Result<RolloutReport> {
        let service = session.service.clone();
        let target = session.target_spec_id.clone();
        let mut tracked = self.track(&service);
        self.observers.emit(RolloutEvent::RolloutStarted {
            session: session.clone(),
        });

        if let Err(e) = initiator::activate(self.plane(), &service, &target).await {
            self.fail(&mut session, &e)?;
            return Err(e.with_context(context_for(&session)));
        }

        let watcher = StabilityWatcher::new(self.plane(), self.settings, &self.observers);
        let report = match watcher
            .watch(&service, session.id, Some(&target), tracked.deadline())
            .await
        {
            Ok(report) => report,
            Err(e) => {
                self.fail(&mut session, &e)?;
                return Err(e.with_context(context_for(&session)));
            }
        };
        if let Some(status) = report.last_status {
            session.observe(status);
        }

        match report.outcome {
            WatchOutcome::Stable => {
                session.record(RolloutOutcome::Stable, None)?;
                tracing::info!(service = %service, spec_id = %target, polls = report.polls, "rollout stable");
                self.observers.emit(RolloutEvent::RolloutStable {
                    session: session.clone(),
                });
            }
            WatchOutcome::TimedOut => {
                session.record(
                    RolloutOutcome::TimedOut,
                    Some(format!(
                        "{} not stable after {} polls",
                        target, report.polls
                    )),
                )?;
                self.observers.emit(RolloutEvent::RolloutTimedOut {
                    session: session.clone(),
                });
                if auto_rollback {
                    // fresh deadline for the rollback watch
                    let deadline = tracked.rearm();
                    self.roll_back(&mut session, deadline).await?;
                }
            }
        }

        let health = self.health_of(&service).await;
        Ok(RolloutReport { session, health })
    }

    async fn roll_back(&self, session: &mut RolloutSession, deadline: Deadline) -> Result<()> {
        RollbackManager::new(self.plane(), self.settings, &self.observers)
            .roll_back(session, deadline)
            .await
    }

    fn fail(&self, session: &mut RolloutSession, err: &RolloutError) -> Result<()> {
        session.record(RolloutOutcome::Failed, Some(err.to_string()))?;
        self.observers.emit(RolloutEvent::RolloutFailed {
            session: session.clone(),
        });
        Ok(())
    }

    async fn health_of(&self, service: &ServiceRef) -> Option<HealthReport> {
        match health::report(self.plane(), service).await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "post-rollout health check failed");
                None
            }
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, InFlightMap> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, service: &ServiceRef) -> Tracked<'_> {
        let (handle, deadline) = watcher::deadline(self.settings.timeout);
        self.in_flight().insert(service.clone(), handle);
        Tracked {
            orchestrator: self,
            service: service.clone(),
            deadline,
        }
    }
}

fn context_for(session: &RolloutSession) -> RolloutContext {
    RolloutContext {
        service: session.service.clone(),
        target_spec_id: Some(session.target_spec_id.clone()),
        previous_spec_id: Some(session.previous_spec_id.clone()),
        last_status: session.last_status.clone(),
    }
}

/// Registration of a cancellable watch; removed from the in-flight map on drop.
struct Tracked<'a> {
    orchestrator: &'a Orchestrator,
    service: ServiceRef,
    deadline: Deadline,
}

impl Tracked<'_> {
    fn deadline(&self) -> Deadline {
        self.deadline.clone()
    }

    /// Replace the tracked deadline with a new one starting now.
    fn rearm(&mut self) -> Deadline {
        let (handle, deadline) = watcher::deadline(self.orchestrator.settings.timeout);
        self.orchestrator.in_flight().insert(self.service.clone(), handle);
        self.deadline = deadline.clone();
        deadline
    }
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.orchestrator.in_flight().remove(&self.service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{Convergence, MemoryControlPlane};
    use crate::session::SessionDb;
    use crate::spec::{ContainerDefinition, SpecDraft};
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recorder {
        names: Mutex<Vec<&'static str>>,
    }

    impl Recorder {
        fn names(&self) -> Vec<&'static str> {
            self.names.lock().unwrap().clone()
        }
    }

    impl RolloutObserver for Recorder {
        fn on_event(&self, event: &RolloutEvent) {
            self.names.lock().unwrap().push(event.name());
        }
    }

    struct Fixture {
        plane: Arc<MemoryControlPlane>,
        orch: Orchestrator,
        recorder: Arc<Recorder>,
        svc: ServiceRef,
        previous: SpecId,
    }

    fn fixture(settings: WatchSettings) -> Fixture {
        let plane = Arc::new(MemoryControlPlane::new());
        let svc = ServiceRef::new("prod", "api");
        let draft = SpecDraft::new(
            "api",
            vec![
                ContainerDefinition::new("api", "registry/api:v1"),
                ContainerDefinition::new("sidecar", "registry/proxy:v3"),
            ],
        );
        let previous = plane.seed_service(&svc, &draft, 2).unwrap();
        let recorder = Arc::new(Recorder::default());
        let orch = Orchestrator::new(plane.clone(), settings).with_observer(recorder.clone());
        Fixture {
            plane,
            orch,
            recorder,
            svc,
            previous,
        }
    }

    fn request(svc: &ServiceRef, image: &str, auto_rollback: bool) -> RolloutRequest {
        RolloutRequest {
            service: svc.clone(),
            changes: vec![SpecChange::set_image("api", image)],
            auto_rollback,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rollout_becomes_stable_within_two_polls() {
        let fx = fixture(WatchSettings::default());
        let next = fx.plane.set_next_convergence("api", Convergence::PendingFor(1));

        let start = Instant::now();
        let report = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v2", false))
            .await
            .unwrap();

        assert_eq!(report.outcome(), RolloutOutcome::Stable);
        assert_eq!(report.session.target_spec_id, next);
        assert_eq!(report.session.previous_spec_id, fx.previous);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
        assert_eq!(fx.plane.active_spec_id(&fx.svc), Some(next.clone()));

        let registered = fx.plane.spec(&next).unwrap();
        assert_eq!(registered.draft.container("api").unwrap().image, "registry/api:v2");
        assert_eq!(
            registered.draft.container("sidecar").unwrap().image,
            "registry/proxy:v3"
        );

        assert!(report.health.unwrap().is_healthy());
        assert_eq!(
            fx.recorder.names(),
            vec![
                "rollout_started",
                "rollout_progress",
                "rollout_progress",
                "rollout_stable"
            ]
        );
        assert!(fx.orch.locks().holder(&fx.svc).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_without_auto_rollback_leaves_target_active() {
        let fx = fixture(WatchSettings {
            timeout: Duration::from_secs(120),
            ..WatchSettings::default()
        });
        let next = fx.plane.set_next_convergence("api", Convergence::Never);

        let start = Instant::now();
        let report = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v2", false))
            .await
            .unwrap();

        assert_eq!(report.outcome(), RolloutOutcome::TimedOut);
        assert_eq!(start.elapsed(), Duration::from_secs(120));
        assert_eq!(fx.plane.active_spec_id(&fx.svc), Some(next));
        assert!(!report.session.rollback_attempted);
        assert!(fx.recorder.names().contains(&"rollout_timed_out"));
    }

    #[tokio::test(start_paused = true)]
    async fn auto_rollback_restores_previous_spec() {
        let fx = fixture(WatchSettings {
            timeout: Duration::from_secs(120),
            ..WatchSettings::default()
        });
        fx.plane.set_next_convergence("api", Convergence::Never);

        let report = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v2", true))
            .await
            .unwrap();

        assert_eq!(report.outcome(), RolloutOutcome::RolledBack);
        assert_eq!(fx.plane.active_spec_id(&fx.svc), Some(fx.previous.clone()));
        let activations = fx.plane.activations();
        assert_eq!(activations.len(), 2);
        assert!(activations.iter().all(|a| a.force_new_rollout));
        let names = fx.recorder.names();
        let tail = &names[names.len() - 3..];
        assert_eq!(tail, ["rollout_rolling_back", "rollout_progress", "rollout_rolled_back"]);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_rollback_runs_once() {
        let fx = fixture(WatchSettings {
            timeout: Duration::from_secs(60),
            ..WatchSettings::default()
        });
        fx.plane.set_next_convergence("api", Convergence::Never);
        let timed_out = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v2", false))
            .await
            .unwrap();
        assert_eq!(timed_out.outcome(), RolloutOutcome::TimedOut);

        let rolled_back = fx.orch.rollback(timed_out.session).await.unwrap();
        assert_eq!(rolled_back.outcome(), RolloutOutcome::RolledBack);
        assert_eq!(fx.plane.active_spec_id(&fx.svc), Some(fx.previous.clone()));

        let err = fx.orch.rollback(rolled_back.session).await.unwrap_err();
        assert!(matches!(err, RolloutError::NothingToRollBack(_)));
        assert_eq!(fx.plane.activations().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rollback_refuses_when_service_moved_on() {
        let fx = fixture(WatchSettings {
            timeout: Duration::from_secs(60),
            ..WatchSettings::default()
        });
        let stuck = fx.plane.set_next_convergence("api", Convergence::Never);
        let timed_out = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v2", false))
            .await
            .unwrap();
        assert_eq!(timed_out.outcome(), RolloutOutcome::TimedOut);

        // someone else ships a fix after the timeout
        let fixed = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v3", false))
            .await
            .unwrap();
        assert_eq!(fixed.outcome(), RolloutOutcome::Stable);
        let activations = fx.plane.activations().len();

        let err = fx.orch.rollback(timed_out.session).await.unwrap_err();
        assert!(matches!(
            err,
            RolloutError::RollbackSuperseded { ref target, ref active, .. }
                if *target == stuck && *active == fixed.session.target_spec_id
        ));
        assert_eq!(fx.plane.activations().len(), activations);
        assert_eq!(
            fx.plane.active_spec_id(&fx.svc),
            Some(fixed.session.target_spec_id.clone())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn second_rollout_for_same_service_is_refused() {
        let fx = fixture(WatchSettings::default());
        fx.plane.set_next_convergence("api", Convergence::Never);

        let orch = fx.orch.clone();
        let first_req = request(&fx.svc, "registry/api:v2", false);
        let first = tokio::spawn(async move { orch.rollout(first_req).await });
        while fx.orch.locks().holder(&fx.svc).is_none() {
            tokio::task::yield_now().await;
        }
        let specs_before = fx.plane.spec_count();

        let err = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v3", false))
            .await
            .unwrap_err();
        assert!(matches!(err, RolloutError::RolloutInProgress { .. }));
        assert_eq!(fx.plane.spec_count(), specs_before);

        while !fx.orch.cancel(&fx.svc) {
            tokio::task::yield_now().await;
        }
        let report = first.await.unwrap().unwrap();
        assert_eq!(report.outcome(), RolloutOutcome::TimedOut);
        assert!(fx.orch.locks().holder(&fx.svc).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_activation_fails_the_session() {
        let fx = fixture(WatchSettings::default());
        let next = fx.plane.set_next_convergence("api", Convergence::default());
        fx.plane.reject_activation_of(&next);

        let err = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v2", true))
            .await
            .unwrap_err();
        assert!(matches!(err.inner(), RolloutError::UpdateRejected { .. }));
        let ctx = err.context().unwrap();
        assert_eq!(ctx.target_spec_id, Some(next));
        assert_eq!(ctx.previous_spec_id, Some(fx.previous.clone()));
        assert_eq!(fx.recorder.names().last(), Some(&"rollout_failed"));
        assert_eq!(fx.plane.active_spec_id(&fx.svc), Some(fx.previous));
        assert!(fx.orch.locks().holder(&fx.svc).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_container_registers_nothing() {
        let fx = fixture(WatchSettings::default());
        let before = fx.plane.spec_count();

        let err = fx
            .orch
            .rollout(RolloutRequest {
                service: fx.svc.clone(),
                changes: vec![SpecChange::set_image("worker", "registry/worker:v2")],
                auto_rollback: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err.inner(), RolloutError::ContainerNotFound { .. }));
        assert_eq!(fx.plane.spec_count(), before);
        assert!(fx.plane.activations().is_empty());
        assert!(fx.recorder.names().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_service_is_not_found() {
        let fx = fixture(WatchSettings::default());
        let err = fx
            .orch
            .rollout(request(&ServiceRef::new("prod", "ghost"), "x:1", false))
            .await
            .unwrap_err();
        assert!(matches!(err.inner(), RolloutError::NotFound(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn redeploy_without_spec_forces_current_spec() {
        let fx = fixture(WatchSettings::default());
        let report = fx.orch.redeploy(&fx.svc, None, false).await.unwrap();
        assert_eq!(report.outcome(), RolloutOutcome::Stable);
        assert_eq!(report.session.target_spec_id, fx.previous);
        assert_eq!(fx.plane.spec_count(), 1);
        assert!(fx.plane.activations()[0].force_new_rollout);
    }

    #[tokio::test(start_paused = true)]
    async fn redeploy_to_explicit_spec() {
        let fx = fixture(WatchSettings::default());
        let first = fx
            .orch
            .rollout(request(&fx.svc, "registry/api:v2", false))
            .await
            .unwrap();
        let report = fx
            .orch
            .redeploy(&fx.svc, Some(&fx.previous), false)
            .await
            .unwrap();
        assert_eq!(report.outcome(), RolloutOutcome::Stable);
        assert_eq!(report.session.previous_spec_id, first.session.target_spec_id);
        assert_eq!(fx.plane.active_spec_id(&fx.svc), Some(fx.previous.clone()));
    }

    #[tokio::test(start_paused = true)]
    async fn journal_records_final_outcome() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Arc::new(SessionDb::open(&dir.path().join("sessions.db")).unwrap());
        let fx = fixture(WatchSettings::default());
        let orch = fx.orch.clone().with_observer(db.clone());

        let report = orch
            .rollout(request(&fx.svc, "registry/api:v2", false))
            .await
            .unwrap();
        let journaled = db.latest_for_service(&fx.svc).unwrap().unwrap();
        assert_eq!(journaled.id, report.session.id);
        assert_eq!(journaled.outcome, RolloutOutcome::Stable);
    }
}
