//! Filesystem layout under `<home>/.rolesync/`.
//!
//! ```text
//! ~/.rolesync/
//!   config.yaml     (optional; defaults apply when absent)
//!   topology.yaml   (group/role/member snapshot served by the daemon)
//!   intents.json    (durable intent table)
//!   daemon.sock     (daemon control socket)
//! ```

use std::path::{Path, PathBuf};

pub const CONFIG_FILE: &str = "config.yaml";
pub const TOPOLOGY_FILE: &str = "topology.yaml";
pub const INTENTS_FILE: &str = "intents.json";
pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn rolesync_root(home: &Path) -> PathBuf {
    home.join(".rolesync")
}

pub fn config_path(home: &Path) -> PathBuf {
    rolesync_root(home).join(CONFIG_FILE)
}

pub fn topology_path(home: &Path) -> PathBuf {
    rolesync_root(home).join(TOPOLOGY_FILE)
}

pub fn intents_path(home: &Path) -> PathBuf {
    rolesync_root(home).join(INTENTS_FILE)
}

pub fn socket_path(home: &Path) -> PathBuf {
    rolesync_root(home).join(DAEMON_SOCKET)
}
