//! Capability traits the engine consumes from a chat platform.
//!
//! A concrete adapter translates its SDK's guild/role/member objects into
//! [`GroupSnapshot`] and [`MemberView`] and implements these two traits.
//! [`crate::memory::InMemoryPlatform`] is the adapter shipped with this crate.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use rolesync_core::{GroupId, GroupSnapshot, MemberView, RoleDef, SubjectId};

/// Failure of a single platform call.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PlatformError {
    /// The subject is not a member of the group.
    #[error("member not found")]
    NotFound,

    /// The group is unknown or no longer accessible.
    #[error("group {0} is not accessible")]
    UnknownGroup(GroupId),

    /// Network or rate-limit failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Missing permission for the requested mutation.
    #[error("permission denied: {0}")]
    Permission(String),

    /// The call did not complete within the configured timeout.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
}

/// Read side: groups, their role catalogs, and member lookups.
#[async_trait]
pub trait GroupCatalog: Send + Sync {
    /// Every group the process has access to.
    async fn groups(&self) -> Result<Vec<GroupSnapshot>, PlatformError>;

    /// The subject's membership in `group`; [`PlatformError::NotFound`] if absent.
    async fn member(
        &self,
        group: &GroupId,
        subject: &SubjectId,
    ) -> Result<MemberView, PlatformError>;

    /// All members of `group`.
    async fn members(&self, group: &GroupId) -> Result<Vec<MemberView>, PlatformError>;
}

/// Write side: grant or revoke a single role.
#[async_trait]
pub trait MembershipMutator: Send + Sync {
    async fn add_role(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
    ) -> Result<(), PlatformError>;

    async fn remove_role(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
    ) -> Result<(), PlatformError>;
}

/// Run a platform call under an optional timeout.
pub(crate) async fn bounded<T, F>(limit: Option<Duration>, call: F) -> Result<T, PlatformError>
where
    F: Future<Output = Result<T, PlatformError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, call)
            .await
            .unwrap_or(Err(PlatformError::Timeout(limit))),
        None => call.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true, flavor = "current_thread")]
    async fn bounded_call_times_out() {
        let limit = Duration::from_secs(5);
        let result: Result<(), _> = bounded(Some(limit), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(PlatformError::Timeout(limit)));
    }

    #[tokio::test]
    async fn unbounded_call_passes_through() {
        let result = bounded(None, async { Err::<(), _>(PlatformError::NotFound) }).await;
        assert_eq!(result, Err(PlatformError::NotFound));
    }
}
