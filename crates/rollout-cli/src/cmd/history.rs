use crate::output::{print_json, print_table};
use rollout_core::session::RolloutSession;
use std::path::Path;

pub fn run(root: &Path, service: Option<&str>, limit: usize, json: bool) -> anyhow::Result<()> {
    let config = super::load_config(root, None)?;
    let db = super::open_journal(root, config.rollout.watch_settings().timeout)?;

    let sessions: Vec<RolloutSession> = match service {
        Some(raw) => db.list_for_service(&super::parse_service(raw)?)?,
        None => db.list_all()?,
    }
    .into_iter()
    .take(limit)
    .collect();

    if json {
        return print_json(&sessions);
    }
    if sessions.is_empty() {
        println!("No rollouts recorded.");
        return Ok(());
    }

    let rows = sessions
        .iter()
        .map(|s| {
            vec![
                s.started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                s.service.to_string(),
                s.outcome.to_string(),
                s.target_spec_id.to_string(),
                s.previous_spec_id.to_string(),
                s.id.to_string()[..8].to_string(),
            ]
        })
        .collect();
    print_table(
        &["STARTED", "SERVICE", "OUTCOME", "TARGET", "PREVIOUS", "SESSION"],
        rows,
    );
    Ok(())
}
