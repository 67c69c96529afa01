//! stepguardd - simulated replica-set node
//!
//! Serves the stepguard wire protocol on a TCP socket until interrupted.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use stepguardd::{NodeConfig, spawn_node};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "stepguardd")]
#[command(author, version, about = "stepguard simulated replica-set node")]
struct Cli {
    /// Address to listen on (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Replica set name
    #[arg(long)]
    set_name: Option<String>,

    /// Number of simulated priority-0 secondaries
    #[arg(long)]
    secondaries: Option<u32>,

    /// Delay before a secondary applies a write (e.g. "20ms")
    #[arg(long, value_parser = humantime::parse_duration)]
    replication_lag: Option<Duration>,

    /// Close every client connection when stepping down
    #[arg(long)]
    close_connections_on_step_down: bool,

    /// Interrupt in-flight reads when stepping down
    #[arg(long)]
    interrupt_reads_on_step_down: bool,

    /// Path to a TOML node configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = NodeConfig::load(self.config.as_deref())
            .context("Failed to load node configuration")?;
        if let Some(listen) = &self.listen {
            config.listen = listen.clone();
        }
        if let Some(set_name) = &self.set_name {
            config.set_name = set_name.clone();
        }
        if let Some(secondaries) = self.secondaries {
            config.secondaries = secondaries;
        }
        if let Some(lag) = self.replication_lag {
            config.replication_lag = lag;
        }
        config.close_connections_on_step_down |= self.close_connections_on_step_down;
        config.interrupt_reads_on_step_down |= self.interrupt_reads_on_step_down;
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    let config = cli.node_config()?;
    info!(
        "Starting stepguardd (set {}, {} secondaries, lag {:?})",
        config.set_name, config.secondaries, config.replication_lag
    );

    let running = spawn_node(config).await?;
    println!("listening on {}", running.addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down");
    running.shutdown().await;
    Ok(())
}
