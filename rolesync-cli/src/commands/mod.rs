pub mod daemon;
pub mod intents;
pub mod roles;
pub mod sync;

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};

use rolesync_daemon::DaemonError;

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Turn a daemon client error into a plain message for the user.
pub(crate) fn daemon_reply<T>(result: Result<T, DaemonError>, action: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(DaemonError::DaemonNotRunning { .. }) => Err(anyhow!(
            "daemon is not running; start it with `rolesync daemon start`"
        )),
        Err(DaemonError::Protocol(message)) => Err(anyhow!("{action} failed: {message}")),
        Err(err) => Err(err).context(format!("{action} failed")),
    }
}
