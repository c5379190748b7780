mod cmd;
mod exit;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, deploy::DeployArgs};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "rollout",
    about = "Roll out container image changes to a service and watch them settle",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .rollout/ or .git/)
    #[arg(long, global = true, env = "ROLLOUT_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    /// Control-plane base URL (overrides control_plane.endpoint)
    #[arg(long, global = true, env = "ROLLOUT_ENDPOINT")]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Change a service's spec and roll it out
    Deploy(DeployArgs),

    /// Roll a service back after a timed-out rollout
    Rollback {
        /// Service, as cluster/service
        service: String,
        /// Roll out this spec id instead of the previous one
        #[arg(long, value_name = "SPEC_ID")]
        to: Option<String>,
    },

    /// Show a service's current health
    Health {
        /// Service, as cluster/service
        service: String,
    },

    /// List recorded rollout sessions, newest first
    History {
        /// Only sessions for this cluster/service
        service: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Manage .rollout/config.yaml
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Deploy(_) | Commands::Rollback { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());
    let endpoint = cli.endpoint.as_deref();

    let result = match cli.command {
        Commands::Deploy(args) => cmd::deploy::run(&root, args, endpoint, cli.json),
        Commands::Rollback { service, to } => {
            cmd::rollback::run(&root, &service, to.as_deref(), endpoint, cli.json)
        }
        Commands::Health { service } => {
            cmd::health::run(&root, &service, endpoint, cli.json).map(|()| exit::SUCCESS)
        }
        Commands::History { service, limit } => {
            cmd::history::run(&root, service.as_deref(), limit, cli.json).map(|()| exit::SUCCESS)
        }
        Commands::Config { subcommand } => {
            cmd::config::run(&root, subcommand, cli.json).map(|()| exit::SUCCESS)
        }
    };

    let code = match result {
        Ok(code) => code,
        Err(e) => {
            // Print the full error chain (anyhow's alternate Display)
            eprintln!("error: {e:#}");
            exit::for_error(&e)
        }
    };
    std::process::exit(code);
}
