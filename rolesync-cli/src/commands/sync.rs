//! `rolesync sync`: explicit resets from the primary group.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use serde::Deserialize;
use tabled::{settings::Style, Table, Tabled};

use rolesync_core::SubjectId;
use rolesync_daemon::{request_sync, request_sync_all};

use super::{daemon_reply, home_dir};

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    /// Re-sync your own roles.
    Me {
        /// Your member id.
        #[arg(long = "as", value_name = "SUBJECT")]
        subject: String,
    },
    /// Re-sync another member's roles.
    User {
        /// Member id to reset.
        subject: String,
    },
    /// Re-sync every human member of the primary group, rate limited.
    All {
        /// Emit the raw JSON summary.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Deserialize)]
struct SyncReply {
    summary: String,
    report: ResetView,
}

#[derive(Debug, Deserialize)]
struct ResetView {
    desired: Vec<String>,
    intent_changed: bool,
    outcome: OutcomeView,
}

/// Both outcome shapes; a skipped pass has no changes or failures.
#[derive(Debug, Deserialize)]
struct OutcomeView {
    #[serde(default)]
    applied: Vec<ChangeView>,
    #[serde(default)]
    failures: Vec<FailureView>,
}

#[derive(Debug, Deserialize)]
struct ChangeView {
    group: String,
    role: String,
    action: String,
}

#[derive(Debug, Deserialize)]
struct FailureView {
    group: String,
    role: Option<String>,
    action: Option<String>,
    error: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AllReply {
    primary: String,
    total: usize,
    succeeded: usize,
    failed: usize,
    results: Vec<SubjectLine>,
    duration_ms: u64,
}

#[derive(Debug, Deserialize)]
struct SubjectLine {
    subject: String,
    success: bool,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProgressView {
    done: usize,
    total: usize,
    result: SubjectLine,
}

#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "group")]
    group: String,
    #[tabled(rename = "role")]
    role: String,
    #[tabled(rename = "change")]
    change: String,
}

#[derive(Tabled)]
struct SubjectRow {
    #[tabled(rename = "member")]
    subject: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "detail")]
    detail: String,
}

pub fn run(command: SyncCommand) -> Result<()> {
    let home = home_dir()?;

    match command {
        SyncCommand::Me { subject } => {
            let reply = reset_one(&home, subject)?;
            println!("{} {}", "✓".green().bold(), reply.summary);
            print_reset(&reply.report);
        }
        SyncCommand::User { subject } => {
            let reply = reset_one(&home, subject.clone())?;
            println!("{} reset roles for {subject}: {}", "✓".green().bold(), reply.summary);
            print_reset(&reply.report);
        }
        SyncCommand::All { json } => {
            let result = request_sync_all(&home, |update| {
                if !json {
                    print_progress(update);
                }
            });
            let data = daemon_reply(result, "sync all")?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&data).context("failed to render sync JSON")?
                );
                return Ok(());
            }
            let reply: AllReply =
                serde_json::from_value(data).context("unexpected sync all reply from daemon")?;
            print_all(reply);
        }
    }
    Ok(())
}

fn reset_one(home: &std::path::Path, subject: String) -> Result<SyncReply> {
    let label = format!("sync {subject}");
    let data = daemon_reply(request_sync(home, Some(SubjectId::from(subject))), &label)?;
    serde_json::from_value(data).context("unexpected sync reply from daemon")
}

fn print_reset(report: &ResetView) {
    let desired = if report.desired.is_empty() {
        "(none)".to_string()
    } else {
        report.desired.join(", ")
    };
    let note = if report.intent_changed { "" } else { " (unchanged)" };
    println!("  desired roles: {desired}{note}");

    let mut rows: Vec<ChangeRow> = report
        .outcome
        .applied
        .iter()
        .map(|c| ChangeRow {
            group: c.group.clone(),
            role: c.role.clone(),
            change: match c.action.as_str() {
                "add" => "+ added".green().to_string(),
                _ => "- removed".yellow().to_string(),
            },
        })
        .collect();
    rows.extend(report.outcome.failures.iter().map(|f| ChangeRow {
        group: f.group.clone(),
        role: f.role.clone().unwrap_or_else(|| "-".to_string()),
        change: format!(
            "{} {}",
            f.action.as_deref().unwrap_or("lookup"),
            describe_error(&f.error)
        )
        .red()
        .to_string(),
    }));

    if rows.is_empty() {
        println!("  already in sync");
        return;
    }
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

/// One line per finished subject, e.g. `[2/5] ✓ 42: 1 added`.
fn print_progress(update: serde_json::Value) {
    let Ok(step) = serde_json::from_value::<ProgressView>(update) else {
        return;
    };
    println!("{}", progress_line(&step));
}

fn progress_line(step: &ProgressView) -> String {
    let mark = if step.result.success {
        "✓".green()
    } else {
        "✗".red()
    };
    format!(
        "[{}/{}] {mark} {}: {}",
        step.done, step.total, step.result.subject, step.result.message
    )
}

fn print_all(reply: AllReply) {
    println!(
        "Reset {} member(s) of {} in {:.1}s | {} succeeded | {} failed",
        reply.total,
        reply.primary,
        reply.duration_ms as f64 / 1000.0,
        reply.succeeded,
        reply.failed,
    );
    if reply.results.is_empty() {
        return;
    }

    let rows: Vec<SubjectRow> = reply
        .results
        .into_iter()
        .map(|line| SubjectRow {
            subject: line.subject,
            result: if line.success {
                "ok".green().to_string()
            } else {
                "failed".red().to_string()
            },
            detail: line.message,
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

/// `{"kind": "permission", "detail": "..."}` renders as `failed (permission: ...)`.
fn describe_error(error: &serde_json::Value) -> String {
    let kind = error["kind"].as_str().unwrap_or("error").replace('_', " ");
    match error["detail"].as_str() {
        Some(detail) => format!("failed ({kind}: {detail})"),
        None => format!("failed ({kind})"),
    }
}
