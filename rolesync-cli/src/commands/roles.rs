//! `rolesync roles` / `rolesync rebuild`: syncable role set on the running daemon.

use anyhow::Result;
use colored::Colorize;

use rolesync_daemon::{request_rebuild, request_roles};

use super::{daemon_reply, home_dir};

pub fn list() -> Result<()> {
    let home = home_dir()?;
    let data = daemon_reply(request_roles(&home), "roles")?;
    let roles: Vec<&str> = data["roles"]
        .as_array()
        .map(|roles| roles.iter().filter_map(|r| r.as_str()).collect())
        .unwrap_or_default();

    if roles.is_empty() {
        println!("No syncable roles: no role name appears in more than one group.");
        return Ok(());
    }
    println!("{} syncable role(s):", roles.len());
    for role in roles {
        println!("  {} {role}", "■".cyan());
    }
    Ok(())
}

pub fn rebuild() -> Result<()> {
    let home = home_dir()?;
    let data = daemon_reply(request_rebuild(&home), "rebuild")?;
    println!(
        "{} reclassified: {} syncable role(s)",
        "✓".green().bold(),
        data["syncable"]
    );
    Ok(())
}
