use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use rollout_core::config::{Config, WarnLevel};
use rollout_core::{io, paths};
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a default .rollout/config.yaml
    Init {
        /// Overwrite an existing config
        #[arg(long)]
        force: bool,
    },

    /// Show the effective config (file values over defaults)
    Show,

    /// Validate the config for common mistakes
    Validate,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Init { force } => init(root, force),
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(root: &Path, force: bool) -> anyhow::Result<()> {
    let path = paths::config_path(root);
    let data = serde_yaml::to_string(&Config::default())?;
    let written = if force {
        io::atomic_write(&path, data.as_bytes())?;
        true
    } else {
        io::write_if_missing(&path, data.as_bytes())?
    };
    io::ensure_gitignore_entry(root, paths::SESSIONS_DB)
        .context("failed to update .gitignore")?;

    if written {
        println!("Wrote {}", path.display());
    } else {
        println!("{} already exists (use --force to overwrite)", path.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        return print_json(&config);
    }
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if warnings.iter().any(|w| w.level == WarnLevel::Error) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
