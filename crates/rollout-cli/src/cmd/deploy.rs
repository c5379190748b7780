use crate::exit;
use crate::output::{format_secs, print_json};
use anyhow::Context;
use clap::Args;
use rollout_core::config::Config;
use rollout_core::events::{BroadcastObserver, RolloutEvent};
use rollout_core::orchestrator::{Orchestrator, RolloutReport, RolloutRequest};
use rollout_core::spec::SpecChange;
use rollout_core::types::{RolloutOutcome, ServiceRef};
use rollout_core::watcher::WatchSettings;
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Events buffered for `--events` before a slow stdout starts dropping them.
const EVENT_BUFFER: usize = 256;

#[derive(Args)]
pub struct DeployArgs {
    /// Service to deploy, as cluster/service
    pub service: String,

    /// New image reference for the container
    #[arg(long)]
    pub image: Option<String>,

    /// Container to change (default: config rollout.default_container, then the service name)
    #[arg(long)]
    pub container: Option<String>,

    /// Set an environment variable on the container (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Roll back automatically if the rollout does not stabilize in time
    #[arg(long)]
    pub auto_rollback: bool,

    /// Ask before rolling back after a timeout
    #[arg(long, conflicts_with = "auto_rollback")]
    pub interactive: bool,

    /// Seconds between status polls
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub poll_interval: Option<u64>,

    /// Seconds to wait for stability before giving up
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub timeout: Option<u64>,

    /// Stream rollout events to stdout as JSON lines while the rollout runs
    #[arg(long)]
    pub events: bool,

    /// Consecutive converged polls required for stability
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub confirmations: Option<u32>,
}

impl DeployArgs {
    fn watch_settings(&self, config: &Config) -> WatchSettings {
        let base = config.rollout.watch_settings();
        WatchSettings {
            poll_interval: self
                .poll_interval
                .map(Duration::from_secs)
                .unwrap_or(base.poll_interval),
            timeout: self.timeout.map(Duration::from_secs).unwrap_or(base.timeout),
            stable_confirmations: self.confirmations.unwrap_or(base.stable_confirmations),
        }
    }

    fn changes(&self, service: &ServiceRef, config: &Config) -> anyhow::Result<Vec<SpecChange>> {
        let container = self
            .container
            .clone()
            .or_else(|| config.rollout.default_container.clone())
            .unwrap_or_else(|| service.service.clone());

        let mut changes = Vec::new();
        if let Some(image) = &self.image {
            changes.push(SpecChange::set_image(&container, image));
        }
        for pair in &self.env {
            changes.push(SpecChange::parse_env(&container, pair).context("invalid --env")?);
        }
        Ok(changes)
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, args: DeployArgs, endpoint: Option<&str>, json: bool) -> anyhow::Result<i32> {
    let config = super::load_config(root, endpoint)?;
    super::ensure_valid(&config)?;
    let service = super::parse_service(&args.service)?;
    let settings = args.watch_settings(&config);
    let changes = args.changes(&service, &config)?;
    let auto_rollback = args.auto_rollback || (config.rollout.auto_rollback && !args.interactive);
    let interactive = args.interactive;

    let journal = super::open_journal(root, settings.timeout)?;
    let orch = super::orchestrator(&config, settings, journal, &service)?;
    let (orch, events) = if args.events {
        let broadcast = Arc::new(BroadcastObserver::new(EVENT_BUFFER));
        let rx = broadcast.subscribe();
        (orch.with_observer(broadcast), Some(rx))
    } else {
        (orch, None)
    };

    let target = service.clone();
    let rt = super::runtime()?;
    let report = rt.block_on(async move {
        let printer = events.map(|rx| tokio::spawn(print_events(rx)));
        let report = deploy(&orch, target, changes, auto_rollback, interactive).await;
        // the orchestrator owns the only sender; dropping it ends the stream
        drop(orch);
        if let Some(printer) = printer {
            if let Err(e) = printer.await {
                tracing::warn!(error = %e, "event printer stopped early");
            }
        }
        report
    });
    let report = report.with_context(|| format!("deploy of {service} failed"))?;

    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(exit::for_outcome(report.outcome()))
}

async fn deploy(
    orch: &Orchestrator,
    service: ServiceRef,
    changes: Vec<SpecChange>,
    auto_rollback: bool,
    interactive: bool,
) -> anyhow::Result<RolloutReport> {
    let report = if changes.is_empty() {
        tracing::info!(service = %service, "no changes given, forcing a fresh deployment of the current spec");
        orch.redeploy(&service, None, auto_rollback).await
    } else {
        orch.rollout(RolloutRequest {
            service,
            changes,
            auto_rollback,
        })
        .await
    }?;
    if report.outcome() == RolloutOutcome::TimedOut && interactive && confirm_rollback(&report)? {
        return Ok(orch.rollback(report.session).await?);
    }
    Ok(report)
}

/// Print each event as one JSON line until the channel closes.
async fn print_events(mut rx: broadcast::Receiver<RolloutEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(event = event.name(), error = %e, "failed to encode event"),
            },
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event stream fell behind, events dropped")
            }
            Err(RecvError::Closed) => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn confirm_rollback(report: &RolloutReport) -> anyhow::Result<bool> {
    let session = &report.session;
    eprint!(
        "{} did not stabilize on {}. Roll back to {}? [y/N] ",
        session.service, session.target_spec_id, session.previous_spec_id
    );
    std::io::stderr().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

pub(crate) fn print_report(report: &RolloutReport) {
    let s = &report.session;
    println!("Service:  {}", s.service);
    println!("Session:  {}", s.id);
    println!("Outcome:  {}", s.outcome);
    println!("Target:   {}", s.target_spec_id);
    println!("Previous: {}", s.previous_spec_id);
    let elapsed = (s.updated_at - s.started_at).num_seconds().max(0) as u64;
    println!("Elapsed:  {}", format_secs(elapsed));
    if let Some(reason) = &s.reason {
        println!("Reason:   {reason}");
    }
    if let Some(h) = &report.health {
        println!(
            "Health:   {} ({}/{} running, {} pending, {} deployment(s))",
            h.status, h.running_count, h.desired_count, h.pending_count, h.deployment_count
        );
    }
    match s.outcome {
        RolloutOutcome::TimedOut => println!(
            "\nRun `rollout rollback {}` to restore {}.",
            s.service, s.previous_spec_id
        ),
        RolloutOutcome::Failed if s.rollback_attempted => {
            println!("\nRollback failed. Manual intervention required.")
        }
        _ => {}
    }
}
