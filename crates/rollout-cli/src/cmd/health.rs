use crate::output::print_json;
use anyhow::Context;
use rollout_core::health;
use std::path::Path;

pub fn run(root: &Path, service: &str, endpoint: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root, endpoint)?;
    let service = super::parse_service(service)?;
    let plane = super::control_plane(&config)?;

    let report = super::runtime()?
        .block_on(health::report(plane.as_ref(), &service))
        .with_context(|| format!("failed to read health of {service}"))?;

    if json {
        return print_json(&report);
    }
    let verdict = if report.is_healthy() { "healthy" } else { "degraded" };
    println!("Service:     {}", report.service);
    println!("Status:      {} ({verdict})", report.status);
    println!("Spec:        {}", report.active_spec_id);
    println!(
        "Tasks:       {}/{} running, {} pending",
        report.running_count, report.desired_count, report.pending_count
    );
    println!("Deployments: {}", report.deployment_count);
    Ok(())
}
