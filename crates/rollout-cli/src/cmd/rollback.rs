use crate::exit;
use crate::output::print_json;
use anyhow::Context;
use rollout_core::types::{RolloutOutcome, SpecId};
use rollout_core::RolloutError;
use std::path::Path;

use super::deploy::print_report;

/// Roll a service back.
///
/// Without `to`, the latest journaled session for the service must be a
/// `TIMED_OUT` rollout that has not been rolled back yet; it is rolled back to
/// its previous spec. With `to`, the service is rolled out to that spec id.
pub fn run(
    root: &Path,
    service: &str,
    to: Option<&str>,
    endpoint: Option<&str>,
    json: bool,
) -> anyhow::Result<i32> {
    let config = super::load_config(root, endpoint)?;
    super::ensure_valid(&config)?;
    let service = super::parse_service(service)?;
    let settings = config.rollout.watch_settings();

    let journal = super::open_journal(root, settings.timeout)?;
    let pending = match to {
        Some(_) => None,
        None => {
            let latest = journal
                .latest_for_service(&service)
                .context("failed to read session journal")?;
            match latest {
                Some(s) if s.outcome == RolloutOutcome::TimedOut && !s.rollback_attempted => Some(s),
                _ => return Err(RolloutError::NothingToRollBack(service).into()),
            }
        }
    };

    let orch = super::orchestrator(&config, settings, journal, &service)?;
    let rt = super::runtime()?;
    let report = rt
        .block_on(async {
            match (pending, to) {
                (Some(session), _) => orch.rollback(session).await,
                (None, Some(spec)) => orch.redeploy(&service, Some(&SpecId::new(spec)), false).await,
                (None, None) => Err(RolloutError::NothingToRollBack(service.clone())),
            }
        })
        .with_context(|| format!("rollback of {service} failed"))?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(match report.outcome() {
        RolloutOutcome::Stable | RolloutOutcome::RolledBack => exit::SUCCESS,
        RolloutOutcome::TimedOut | RolloutOutcome::Pending => exit::TIMED_OUT,
        RolloutOutcome::Failed => exit::ROLLBACK_FAILED,
    })
}
