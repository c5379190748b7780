//! Rollout lifecycle events and their observers.
//!
//! The orchestrator emits one [`RolloutEvent`] per state change and one
//! `RolloutProgress` per poll. Observers are synchronous and must not block;
//! anything slow belongs behind a [`BroadcastObserver`] subscription.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::session::RolloutSession;
use crate::types::ServiceRef;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RolloutEvent {
    RolloutStarted {
        session: RolloutSession,
    },
    RolloutProgress {
        session_id: Uuid,
        service: ServiceRef,
        poll: u32,
        running: u32,
        desired: u32,
        pending: u32,
    },
    RolloutStable {
        session: RolloutSession,
    },
    RolloutTimedOut {
        session: RolloutSession,
    },
    RolloutRollingBack {
        session: RolloutSession,
    },
    RolloutRolledBack {
        session: RolloutSession,
    },
    RolloutFailed {
        session: RolloutSession,
    },
}

impl RolloutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            RolloutEvent::RolloutStarted { .. } => "rollout_started",
            RolloutEvent::RolloutProgress { .. } => "rollout_progress",
            RolloutEvent::RolloutStable { .. } => "rollout_stable",
            RolloutEvent::RolloutTimedOut { .. } => "rollout_timed_out",
            RolloutEvent::RolloutRollingBack { .. } => "rollout_rolling_back",
            RolloutEvent::RolloutRolledBack { .. } => "rollout_rolled_back",
            RolloutEvent::RolloutFailed { .. } => "rollout_failed",
        }
    }

    /// Session snapshot carried by the event. Progress events carry none.
    pub fn session(&self) -> Option<&RolloutSession> {
        match self {
            RolloutEvent::RolloutProgress { .. } => None,
            RolloutEvent::RolloutStarted { session }
            | RolloutEvent::RolloutStable { session }
            | RolloutEvent::RolloutTimedOut { session }
            | RolloutEvent::RolloutRollingBack { session }
            | RolloutEvent::RolloutRolledBack { session }
            | RolloutEvent::RolloutFailed { session } => Some(session),
        }
    }
}

pub trait RolloutObserver: Send + Sync {
    fn on_event(&self, event: &RolloutEvent);
}

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Logs every event through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl RolloutObserver for TracingObserver {
    fn on_event(&self, event: &RolloutEvent) {
        match event {
            RolloutEvent::RolloutProgress {
                service,
                poll,
                running,
                desired,
                pending,
                ..
            } => {
                tracing::info!(service = %service, poll, running, desired, pending, "rollout progress");
            }
            RolloutEvent::RolloutFailed { session } => {
                tracing::error!(
                    service = %session.service,
                    session = %session.id,
                    target = %session.target_spec_id,
                    previous = %session.previous_spec_id,
                    reason = session.reason.as_deref().unwrap_or(""),
                    "rollout failed"
                );
            }
            RolloutEvent::RolloutTimedOut { session } => {
                tracing::warn!(
                    service = %session.service,
                    session = %session.id,
                    target = %session.target_spec_id,
                    "rollout timed out"
                );
            }
            other => {
                if let Some(session) = other.session() {
                    tracing::info!(
                        service = %session.service,
                        session = %session.id,
                        outcome = %session.outcome,
                        event = other.name(),
                        "rollout event"
                    );
                }
            }
        }
    }
}

/// Fans events out to any number of async subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastObserver {
    tx: broadcast::Sender<RolloutEvent>,
}

impl BroadcastObserver {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RolloutEvent> {
        self.tx.subscribe()
    }
}

impl RolloutObserver for BroadcastObserver {
    fn on_event(&self, event: &RolloutEvent) {
        // no subscribers is fine
        let _ = self.tx.send(event.clone());
    }
}

/// Ordered set of observers notified for every event.
#[derive(Clone, Default)]
pub struct Observers {
    inner: Vec<Arc<dyn RolloutObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, observer: Arc<dyn RolloutObserver>) {
        self.inner.push(observer);
    }

    pub fn emit(&self, event: RolloutEvent) {
        for observer in &self.inner {
            observer.on_event(&event);
        }
    }
}
