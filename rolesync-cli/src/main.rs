//! Rolesync: keep shared roles in step across every group.
//!
//! # Usage
//!
//! ```text
//! rolesync daemon start|stop|status [--json]
//! rolesync sync me --as <subject>
//! rolesync sync user <subject>
//! rolesync sync all [--json]
//! rolesync intents [<subject>] [--json]
//! rolesync roles
//! rolesync rebuild
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, intents::IntentsArgs, sync::SyncCommand};

#[derive(Parser, Debug)]
#[command(
    name = "rolesync",
    version,
    about = "Synchronize shared roles across groups",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or control the background reconciliation daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Rebuild desired roles from the primary group and push them everywhere.
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },

    /// Show recorded role intents (read straight from the intent store).
    Intents(IntentsArgs),

    /// List the roles currently classified as syncable.
    Roles,

    /// Reclassify syncable roles from the current group topology.
    Rebuild,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Sync { command } => commands::sync::run(command),
        Commands::Intents(args) => args.run(),
        Commands::Roles => commands::roles::list(),
        Commands::Rebuild => commands::roles::rebuild(),
    }
}
