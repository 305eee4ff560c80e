//! Error types for rolesync-engine.

use thiserror::Error;

use rolesync_core::{GroupId, StoreError, SubjectId};

use crate::platform::PlatformError;

/// All errors that can abort a reconciliation pass, a listener callback or a reset.
///
/// Per-role mutation failures never surface here; they are collected in the
/// pass report instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The subject is absent from a group it was explicitly looked up in.
    #[error("{subject} is not a member of group {group}")]
    NotAMember { group: GroupId, subject: SubjectId },

    /// Primary group unset or inaccessible.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Durable intent table failure.
    #[error("intent store error: {0}")]
    Storage(#[from] StoreError),

    /// A platform call needed by the whole pass failed (e.g. listing groups).
    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    /// A blocking store task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}
