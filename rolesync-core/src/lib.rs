//! Rolesync core library: domain types, intent persistence, configuration.
//!
//! - [`types`]: newtypes and platform-neutral snapshots
//! - [`error`]: [`StoreError`], [`ConfigError`]
//! - [`intent_store`]: durable (subject, role) intent table
//! - [`config`]: `config.yaml` loading and validation
//! - [`paths`]: `~/.rolesync/` layout

pub mod config;
pub mod error;
pub mod intent_store;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::{ConfigError, StoreError};
pub use intent_store::IntentStore;
pub use types::{
    GroupId, GroupSnapshot, MemberUpdate, MemberView, RoleDef, RoleId, RoleName, SubjectId,
};
