//! stepguard - verify that reads in flight survive a replica-set step-down.
//!
//! `stepguard run` drives the full scenario against a target node; the other
//! subcommands issue the individual administrative commands it is built from.

#![forbid(unsafe_code)]

mod commands;
mod render;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use stepguard_common::{FailPointMode, HarnessSettings, Namespace};
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "stepguard")]
#[command(author, version, about = "Verify reads survive a replica-set step-down")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Target node (host:port); overrides the config file and STEPGUARD_ENDPOINT
    #[arg(short, long, global = true)]
    endpoint: Option<String>,

    /// Path to a TOML harness configuration
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit machine-readable JSON (results on stdout, logs on stderr)
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the read-operations-during-step-down scenario
    Run {
        /// Leave fail points armed after the operations park (negative test)
        #[arg(long)]
        keep_fail_points: bool,
    },

    /// Configure a fail point on the target node
    FailPoint {
        /// Fail point name
        name: String,

        /// off, alwaysOn or times:N
        mode: FailPointMode,
    },

    /// List operations currently running on the target node
    CurrentOp {
        /// Only operations on this namespace (db.collection)
        #[arg(long)]
        ns: Option<Namespace>,

        /// Only operations whose diagnostic message equals this
        #[arg(long)]
        msg: Option<String>,
    },

    /// Show replica-set status
    Status,

    /// Print server log lines
    Log {
        /// First sequence number to print
        #[arg(long)]
        since: Option<u64>,
    },

    /// Return the target node to primary
    StepUp,
}

fn init_logging(cli: &Cli, configured_level: &str) {
    let default_level = if cli.verbose { "debug" } else { configured_level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = if cli.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_writer(std::io::stderr).boxed()
    };

    tracing_subscriber::registry().with(layer).with(filter).init();
}

fn load_settings(cli: &Cli) -> Result<HarnessSettings> {
    let mut settings = HarnessSettings::load(cli.config.as_deref())
        .context("Failed to load harness configuration")?;
    if let Some(endpoint) = &cli.endpoint {
        settings.target.endpoint = endpoint.clone();
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&cli, &settings.logging.level);
    debug!(endpoint = %settings.target.endpoint, "Loaded settings");

    match dispatch(&cli, settings).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the selected subcommand, returning whether it succeeded.
async fn dispatch(cli: &Cli, mut settings: HarnessSettings) -> Result<bool> {
    match &cli.command {
        Commands::Run { keep_fail_points } => {
            if *keep_fail_points {
                settings.scenario.release_fail_points = false;
            }
            commands::run(&settings, cli.json).await
        }
        Commands::FailPoint { name, mode } => {
            commands::fail_point(&settings, name, *mode, cli.json).await
        }
        Commands::CurrentOp { ns, msg } => {
            commands::current_op(&settings, ns.as_ref(), msg.as_deref(), cli.json).await
        }
        Commands::Status => commands::status(&settings, cli.json).await,
        Commands::Log { since } => commands::log(&settings, *since, cli.json).await,
        Commands::StepUp => commands::step_up(&settings, cli.json).await,
    }
}
