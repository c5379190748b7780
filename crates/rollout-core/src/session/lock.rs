//! Per-service mutual exclusion.
//!
//! At most one live rollout session may exist per service. [`ServiceLocks`]
//! tracks which session holds each service; [`ServiceLease`] is the RAII
//! handle, and dropping it releases the service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::error::{Result, RolloutError};
use crate::types::ServiceRef;

#[derive(Debug, Clone, Default)]
pub struct ServiceLocks {
    held: Arc<Mutex<HashMap<ServiceRef, Uuid>>>,
}

impl ServiceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ServiceRef, Uuid>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `service` for `session`, or fail with `RolloutInProgress`.
    pub fn try_acquire(&self, service: &ServiceRef, session: Uuid) -> Result<ServiceLease> {
        let mut held = self.lock();
        if let Some(holder) = held.get(service) {
            return Err(RolloutError::RolloutInProgress {
                service: service.clone(),
                session: *holder,
            });
        }
        held.insert(service.clone(), session);
        tracing::debug!(service = %service, session = %session, "service lease acquired");
        Ok(ServiceLease {
            locks: self.clone(),
            service: service.clone(),
            session,
        })
    }

    /// Session currently holding `service`, if any.
    pub fn holder(&self, service: &ServiceRef) -> Option<Uuid> {
        self.lock().get(service).copied()
    }
}

/// Exclusive claim on one service. Released on drop.
#[derive(Debug)]
pub struct ServiceLease {
    locks: ServiceLocks,
    service: ServiceRef,
    session: Uuid,
}

impl ServiceLease {
    pub fn session_id(&self) -> Uuid {
        self.session
    }
}

impl Drop for ServiceLease {
    fn drop(&mut self) {
        let mut held = self.locks.lock();
        if held.get(&self.service) == Some(&self.session) {
            held.remove(&self.service);
            tracing::debug!(service = %self.service, session = %self.session, "service lease released");
        }
    }
}
