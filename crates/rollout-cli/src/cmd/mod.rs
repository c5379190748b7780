pub mod config;
pub mod deploy;
pub mod health;
pub mod history;
pub mod rollback;

use anyhow::Context;
use rollout_core::config::{Config, WarnLevel};
use rollout_core::control_plane::{ControlPlane, HttpControlPlane, RetryingControlPlane};
use rollout_core::events::TracingObserver;
use rollout_core::orchestrator::Orchestrator;
use rollout_core::paths;
use rollout_core::session::SessionDb;
use rollout_core::types::ServiceRef;
use rollout_core::RolloutError;
use rollout_core::watcher::WatchSettings;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Pending sessions this much older than the rollout timeout are abandoned.
const RECOVERY_GRACE: Duration = Duration::from_secs(5 * 60);

// ---------------------------------------------------------------------------
// Shared setup
// ---------------------------------------------------------------------------

/// Load config from `root`, applying the `--endpoint` override.
pub fn load_config(root: &Path, endpoint: Option<&str>) -> anyhow::Result<Config> {
    let mut config = Config::load(root).context("failed to load config")?;
    if let Some(endpoint) = endpoint {
        config.control_plane.endpoint = endpoint.to_string();
    }
    Ok(config)
}

/// Refuse to act on a config that `config validate` reports errors for.
pub fn ensure_valid(config: &Config) -> anyhow::Result<()> {
    let errors: Vec<String> = config
        .validate()
        .into_iter()
        .filter(|w| w.level == WarnLevel::Error)
        .map(|w| w.message)
        .collect();
    if !errors.is_empty() {
        anyhow::bail!("invalid config: {}", errors.join("; "));
    }
    Ok(())
}

pub fn parse_service(raw: &str) -> anyhow::Result<ServiceRef> {
    raw.parse::<ServiceRef>()
        .with_context(|| format!("expected cluster/service, got '{raw}'"))
}

/// HTTP control plane with the configured retry policy in front of it.
pub fn control_plane(config: &Config) -> anyhow::Result<Arc<dyn ControlPlane>> {
    let cp = &config.control_plane;
    let http = HttpControlPlane::new(&cp.endpoint, cp.request_timeout(), cp.token())
        .context("failed to build control-plane client")?;
    tracing::debug!(endpoint = http.endpoint(), "using control plane");
    Ok(Arc::new(RetryingControlPlane::new(
        http,
        config.retry.policy(),
    )))
}

pub fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("failed to start async runtime")
}

/// Open the session journal and fail any sessions abandoned by a dead process.
pub fn open_journal(root: &Path, timeout: Duration) -> anyhow::Result<SessionDb> {
    let path = paths::sessions_db_path(root);
    let db = SessionDb::open(&path)
        .with_context(|| format!("failed to open session journal at {}", path.display()))?;
    db.startup_recovery(timeout + RECOVERY_GRACE)
        .context("failed to recover abandoned sessions")?;
    Ok(db)
}

/// Orchestrator wired to the control plane, tracing, and the session journal.
///
/// The journal stays open until the process exits, so it also keeps a second
/// `deploy` or `rollback` in this project out until the first one finishes.
/// A `PENDING` session for `service` left by a process that died mid-rollout
/// blocks it until recovery marks that session abandoned.
pub fn orchestrator(
    config: &Config,
    settings: WatchSettings,
    journal: SessionDb,
    service: &ServiceRef,
) -> anyhow::Result<Orchestrator> {
    if let Some(pending) = journal.pending_for_service(service)? {
        return Err(RolloutError::RolloutInProgress {
            service: service.clone(),
            session: pending.id,
        }
        .into());
    }
    Ok(Orchestrator::new(control_plane(config)?, settings)
        .with_observer(Arc::new(TracingObserver))
        .with_observer(Arc::new(journal)))
}
