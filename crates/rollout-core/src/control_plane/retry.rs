//! Bounded exponential backoff for control-plane calls.
//!
//! Only [`Transient`](super::ControlPlaneError::Transient) errors are retried. Everything else
//! is returned on the first occurrence. Delays follow
//! `min(max_delay, base_delay * 2^attempt)`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::{ControlPlane, PlaneResult};
use crate::spec::{SpecDraft, WorkloadSpec};
use crate::types::{ServiceRef, ServiceStatus, SpecId};

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 4;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op`, retrying transient failures.
    pub async fn run<T, F, Fut>(&self, name: &'static str, mut op: F) -> PlaneResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PlaneResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        op = name,
                        attempt = attempt + 1,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient control-plane error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// [`ControlPlane`] decorator that retries transient failures.
///
/// `register_spec` is retried too: a registration that succeeded server-side
/// but whose response was lost leaves an orphaned, inactive spec behind.
pub struct RetryingControlPlane<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C: ControlPlane> RetryingControlPlane<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }
}

#[async_trait]
impl<C: ControlPlane> ControlPlane for RetryingControlPlane<C> {
    async fn get_service(&self, service: &ServiceRef) -> PlaneResult<ServiceStatus> {
        let inner = &self.inner;
        self.policy
            .run("get_service", move || inner.get_service(service))
            .await
    }

    async fn get_active_spec(&self, service: &ServiceRef) -> PlaneResult<WorkloadSpec> {
        let inner = &self.inner;
        self.policy
            .run("get_active_spec", move || inner.get_active_spec(service))
            .await
    }

    async fn register_spec(&self, draft: &SpecDraft) -> PlaneResult<WorkloadSpec> {
        let inner = &self.inner;
        self.policy
            .run("register_spec", move || inner.register_spec(draft))
            .await
    }

    async fn set_active_spec(
        &self,
        service: &ServiceRef,
        spec_id: &SpecId,
        force_new_rollout: bool,
    ) -> PlaneResult<()> {
        let inner = &self.inner;
        self.policy
            .run("set_active_spec", move || {
                inner.set_active_spec(service, spec_id, force_new_rollout)
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{ControlPlaneError, MemoryControlPlane, Operation};
    use crate::spec::{ContainerDefinition, SpecDraft};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for(0), Duration::from_millis(100));
        assert_eq!(p.delay_for(1), Duration::from_millis(200));
        assert_eq!(p.delay_for(3), Duration::from_millis(800));
        assert_eq!(p.delay_for(4), Duration::from_millis(1000));
        assert_eq!(p.delay_for(40), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = policy(3)
            .run("flaky", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(ControlPlaneError::Transient("503".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: PlaneResult<()> = policy(2)
            .run("flaky", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ControlPlaneError::Transient("timeout".into()))
            })
            .await;
        assert!(result.unwrap_err().is_transient());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn non_transient_errors_fail_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: PlaneResult<()> = policy(5)
            .run("flaky", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ControlPlaneError::Rejected("bad spec".into()))
            })
            .await;
        assert!(matches!(result, Err(ControlPlaneError::Rejected(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn decorator_hides_a_transient_blip() {
        let mem = Arc::new(MemoryControlPlane::new());
        let svc = ServiceRef::new("c", "api");
        let draft = SpecDraft::new("api", vec![ContainerDefinition::new("api", "img:v1")]);
        mem.seed_service(&svc, &draft, 1).unwrap();
        mem.fail_next(
            Operation::GetActiveSpec,
            ControlPlaneError::Transient("connection reset".into()),
        );

        let plane = RetryingControlPlane::new(Arc::clone(&mem), policy(1));
        let spec = plane.get_active_spec(&svc).await.unwrap();
        assert_eq!(spec.spec_id.as_str(), "api:1");
    }
}
