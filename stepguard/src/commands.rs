//! Subcommand handlers.

use anyhow::{Context, Result};
use serde::Serialize;
use stepguard_common::{
    Connection, Endpoint, FailPointMode, HarnessSettings, Namespace, ReadOpsDuringStepDown,
    set_fail_point,
};
use tracing::info;

use crate::render;

fn connection(settings: &HarnessSettings) -> Connection {
    Connection::new(Endpoint::new(settings.target.endpoint.clone()))
        .with_connect_timeout(settings.timeouts.connect_timeout)
        .with_command_timeout(settings.timeouts.command_timeout)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn run(settings: &HarnessSettings, json: bool) -> Result<bool> {
    let config = settings
        .to_scenario_config()
        .context("Invalid scenario configuration")?;
    info!(endpoint = %config.endpoint, ns = %config.namespace, "Running scenario");

    let report = match ReadOpsDuringStepDown::new(config).run().await {
        Ok(report) => report,
        Err(failure) => *failure.report,
    };
    if json {
        print_json(&report)?;
    } else {
        print!("{}", render::report(&report));
    }
    Ok(report.passed())
}

pub async fn fail_point(
    settings: &HarnessSettings,
    name: &str,
    mode: FailPointMode,
    json: bool,
) -> Result<bool> {
    let mut conn = connection(settings);
    let reply = set_fail_point(&mut conn, name, mode).await?;
    if json {
        print_json(&reply)?;
    } else {
        println!(
            "{name}: {} -> {mode} (entered {} times)",
            reply.previous_mode, reply.times_entered
        );
    }
    Ok(true)
}

pub async fn current_op(
    settings: &HarnessSettings,
    ns: Option<&Namespace>,
    msg: Option<&str>,
    json: bool,
) -> Result<bool> {
    let mut conn = connection(settings);
    let reply = conn.current_op(ns, msg).await?;
    if json {
        print_json(&reply)?;
    } else {
        print!("{}", render::current_op(&reply));
    }
    Ok(true)
}

pub async fn status(settings: &HarnessSettings, json: bool) -> Result<bool> {
    let mut conn = connection(settings);
    let status = conn.repl_set_get_status().await?;
    if json {
        print_json(&status)?;
    } else {
        print!("{}", render::status(&status));
    }
    Ok(true)
}

pub async fn log(settings: &HarnessSettings, since: Option<u64>, json: bool) -> Result<bool> {
    let mut conn = connection(settings);
    let reply = conn.get_log(since).await?;
    if json {
        print_json(&reply)?;
    } else {
        for line in &reply.lines {
            println!("{line}");
        }
    }
    Ok(true)
}

pub async fn step_up(settings: &HarnessSettings, json: bool) -> Result<bool> {
    let mut conn = connection(settings);
    conn.step_up().await?;
    let hello = conn.hello().await?;
    if json {
        print_json(&hello)?;
    } else {
        println!("{} is now {}", settings.target.endpoint, hello.state);
    }
    Ok(true)
}
