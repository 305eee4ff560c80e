//! `rolesync daemon`: foreground runtime and socket control.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use clap::Subcommand;
use colored::Colorize;
use serde_json::Value;

use rolesync_core::paths::socket_path;
use rolesync_daemon::{request_status, request_stop, start_blocking, DaemonError};

use super::home_dir;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (event listener + socket server).
    Start,
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status {
        /// Emit the raw JSON payload.
        #[arg(long)]
        json: bool,
    },
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let home = home_dir()?;

    match command {
        DaemonCommand::Start => {
            start_blocking(&home).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(&home) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status { json } => {
            let status = match request_status(&home) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(&home).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            } else {
                print_status(&status);
            }
        }
    }

    Ok(())
}

fn print_status(status: &Value) {
    if status["running"] != Value::Bool(true) {
        println!("{} daemon is not running", "■".bright_black().bold());
        return;
    }

    let since = status["started_at_unix"]
        .as_i64()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let primary = status["primary_group"].as_str().unwrap_or("(not configured)");
    let reconciling = status["reconciling"].as_array().map_or(0, Vec::len);
    let events = &status["events"];

    println!("{} daemon running since {since}", "■".green().bold());
    println!("  primary group:          {primary}");
    println!("  syncable roles:         {}", status["syncable_roles"]);
    println!("  subjects with intents:  {}", status["subjects_with_intents"]);
    println!("  passes in flight:       {reconciling}");
    println!(
        "  events:                 {} received, {} recorded, {} suppressed, {} ignored, {} failed",
        events["received"],
        events["recorded"],
        events["suppressed"],
        events["ignored"],
        events["failed"],
    );
}
