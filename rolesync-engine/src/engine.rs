//! Reconciliation engine.
//!
//! ## `reconcile(subject)`: one pass
//!
//! 1. Acquire the subject's guard ticket; if held elsewhere, return `Skipped`.
//! 2. Read the desired set from the intent store.
//! 3. Snapshot the syncable role set and list every accessible group.
//! 4. Per group: fetch the member (absent → skip), then grant
//!    `desired ∩ syncable − held` and revoke `held ∩ syncable − desired`,
//!    never touching managed roles.
//! 5. Drop the ticket (on every exit path) and return the pass report.
//!
//! Each grant/revoke is isolated: a failure is recorded and the pass moves on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use rolesync_core::{GroupId, GroupSnapshot, IntentStore, RoleDef, RoleName, SubjectId};

use crate::classifier::{SyncableMap, SyncableRoles};
use crate::error::SyncError;
use crate::guard::ReconcileGuard;
use crate::platform::{bounded, GroupCatalog, MembershipMutator, PlatformError};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleAction {
    Add,
    Remove,
}

/// A grant or revoke that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleChange {
    pub group: GroupId,
    pub role: RoleName,
    pub action: RoleAction,
}

/// A platform call that failed during a pass.
///
/// `role`/`action` are `None` when the member lookup itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassFailure {
    pub group: GroupId,
    pub role: Option<RoleName>,
    pub action: Option<RoleAction>,
    pub error: PlatformError,
}

/// Everything one completed pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub subject: SubjectId,
    pub desired: BTreeSet<RoleName>,
    /// Groups where the subject is a member.
    pub visited: Vec<GroupId>,
    /// Groups skipped because the subject is not a member there.
    pub not_member: Vec<GroupId>,
    pub applied: Vec<RoleChange>,
    pub failures: Vec<PassFailure>,
    pub duration_ms: u128,
}

impl PassReport {
    fn new(subject: &SubjectId, desired: BTreeSet<RoleName>) -> Self {
        Self {
            subject: subject.clone(),
            desired,
            visited: Vec::new(),
            not_member: Vec::new(),
            applied: Vec::new(),
            failures: Vec::new(),
            duration_ms: 0,
        }
    }

    /// At least one platform call failed; the rest were still attempted.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn count(&self, action: RoleAction) -> usize {
        self.applied.iter().filter(|c| c.action == action).count()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Another pass for the same subject was already running.
    Skipped { subject: SubjectId },
    Completed(PassReport),
}

impl ReconcileOutcome {
    pub fn is_skipped(&self) -> bool {
        matches!(self, ReconcileOutcome::Skipped { .. })
    }

    pub fn report(&self) -> Option<&PassReport> {
        match self {
            ReconcileOutcome::Completed(report) => Some(report),
            ReconcileOutcome::Skipped { .. } => None,
        }
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        match self {
            ReconcileOutcome::Skipped { subject } => {
                format!("skipped {subject}: reconciliation already in progress")
            }
            ReconcileOutcome::Completed(report) => {
                let mut line = format!(
                    "synced {} across {} group(s): {} added, {} removed",
                    report.subject,
                    report.visited.len(),
                    report.count(RoleAction::Add),
                    report.count(RoleAction::Remove),
                );
                if report.is_partial() {
                    line.push_str(&format!(", {} failed", report.failures.len()));
                }
                line
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reconciler
// ---------------------------------------------------------------------------

/// Owns the process-scoped state (syncable roles, guard) and the collaborators.
pub struct Reconciler {
    catalog: Arc<dyn GroupCatalog>,
    mutator: Arc<dyn MembershipMutator>,
    store: Arc<IntentStore>,
    roles: SyncableRoles,
    guard: ReconcileGuard,
    call_timeout: Option<Duration>,
}

impl Reconciler {
    pub fn new(
        catalog: Arc<dyn GroupCatalog>,
        mutator: Arc<dyn MembershipMutator>,
        store: Arc<IntentStore>,
    ) -> Self {
        Self {
            catalog,
            mutator,
            store,
            roles: SyncableRoles::new(),
            guard: ReconcileGuard::new(),
            call_timeout: None,
        }
    }

    /// Bound every platform call; `None` leaves the transport default.
    pub fn with_call_timeout(mut self, limit: Option<Duration>) -> Self {
        self.call_timeout = limit;
        self
    }

    pub fn roles(&self) -> &SyncableRoles {
        &self.roles
    }

    pub fn guard(&self) -> &ReconcileGuard {
        &self.guard
    }

    pub fn store(&self) -> &Arc<IntentStore> {
        &self.store
    }

    pub fn catalog(&self) -> &Arc<dyn GroupCatalog> {
        &self.catalog
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    /// Reclassify syncable roles from the live group topology.
    pub async fn rebuild_roles(&self) -> Result<usize, SyncError> {
        let groups = bounded(self.call_timeout, self.catalog.groups()).await?;
        let count = self.roles.rebuild(&groups).await;
        tracing::info!(groups = groups.len(), syncable = count, "classified syncable roles");
        Ok(count)
    }

    /// Run one reconciliation pass for `subject`.
    pub async fn reconcile(&self, subject: &SubjectId) -> Result<ReconcileOutcome, SyncError> {
        let Some(_ticket) = self.guard.acquire(subject) else {
            tracing::debug!(subject = %subject, "reconciliation already in progress, skipping");
            return Ok(ReconcileOutcome::Skipped {
                subject: subject.clone(),
            });
        };

        let started = Instant::now();
        match self.run_pass(subject).await {
            Ok(mut report) => {
                report.duration_ms = started.elapsed().as_millis();
                if report.is_partial() {
                    tracing::warn!(
                        subject = %subject,
                        added = report.count(RoleAction::Add),
                        removed = report.count(RoleAction::Remove),
                        failed = report.failures.len(),
                        "reconciliation finished with failures",
                    );
                } else {
                    tracing::info!(
                        subject = %subject,
                        added = report.count(RoleAction::Add),
                        removed = report.count(RoleAction::Remove),
                        duration_ms = report.duration_ms,
                        "reconciliation completed",
                    );
                }
                Ok(ReconcileOutcome::Completed(report))
            }
            Err(err) => {
                tracing::error!(subject = %subject, error = %err, "reconciliation pass failed");
                Err(err)
            }
        }
    }

    async fn run_pass(&self, subject: &SubjectId) -> Result<PassReport, SyncError> {
        let desired = {
            let subject = subject.clone();
            self.with_store(move |store| Ok(store.list_roles(&subject)))
                .await?
        };
        let syncable = self.roles.snapshot().await;
        let groups = bounded(self.call_timeout, self.catalog.groups()).await?;

        let mut report = PassReport::new(subject, desired);
        for group in &groups {
            self.reconcile_group(group, subject, &syncable, &mut report)
                .await;
        }
        Ok(report)
    }

    async fn reconcile_group(
        &self,
        group: &GroupSnapshot,
        subject: &SubjectId,
        syncable: &SyncableMap,
        report: &mut PassReport,
    ) {
        let member = match bounded(self.call_timeout, self.catalog.member(&group.id, subject)).await
        {
            Ok(member) => member,
            Err(PlatformError::NotFound) => {
                report.not_member.push(group.id.clone());
                return;
            }
            Err(err) => {
                tracing::warn!(
                    group = %group.id,
                    subject = %subject,
                    error = %err,
                    "member lookup failed; skipping group",
                );
                report.failures.push(PassFailure {
                    group: group.id.clone(),
                    role: None,
                    action: None,
                    error: err,
                });
                return;
            }
        };
        report.visited.push(group.id.clone());

        let held: BTreeMap<&RoleName, &RoleDef> = member
            .roles
            .iter()
            .filter(|r| syncable.contains_key(&r.name))
            .map(|r| (&r.name, r))
            .collect();

        let to_add: Vec<&RoleDef> = report
            .desired
            .iter()
            .filter(|name| syncable.contains_key(*name) && !held.contains_key(name))
            .filter_map(|name| group.role_named(name))
            .filter(|role| !role.managed)
            .collect();

        let to_remove: Vec<&RoleDef> = held
            .iter()
            .filter(|(name, _)| !report.desired.contains(**name))
            .map(|(_, role)| *role)
            .filter(|role| !role.managed)
            .collect();

        for role in to_add {
            self.apply(&group.id, subject, role, RoleAction::Add, report)
                .await;
        }
        for role in to_remove {
            self.apply(&group.id, subject, role, RoleAction::Remove, report)
                .await;
        }
    }

    async fn apply(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
        action: RoleAction,
        report: &mut PassReport,
    ) {
        let call = match action {
            RoleAction::Add => self.mutator.add_role(group, subject, role),
            RoleAction::Remove => self.mutator.remove_role(group, subject, role),
        };
        match bounded(self.call_timeout, call).await {
            Ok(()) => {
                tracing::info!(
                    group = %group,
                    subject = %subject,
                    role = %role.name,
                    action = ?action,
                    "role membership updated",
                );
                report.applied.push(RoleChange {
                    group: group.clone(),
                    role: role.name.clone(),
                    action,
                });
            }
            Err(err) => {
                tracing::warn!(
                    group = %group,
                    subject = %subject,
                    role = %role.name,
                    action = ?action,
                    error = %err,
                    "role update failed",
                );
                report.failures.push(PassFailure {
                    group: group.clone(),
                    role: Some(role.name.clone()),
                    action: Some(action),
                    error: err,
                });
            }
        }
    }

    /// Run a store operation on the blocking pool.
    pub(crate) async fn with_store<T, F>(&self, op: F) -> Result<T, SyncError>
    where
        T: Send + 'static,
        F: FnOnce(&IntentStore) -> Result<T, rolesync_core::StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || op(store.as_ref()))
            .await
            .map_err(|err| SyncError::Task(format!("intent store task join error: {err}")))?
            .map_err(SyncError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryPlatform;
    use tempfile::TempDir;

    fn two_group_platform() -> Arc<InMemoryPlatform> {
        let platform = InMemoryPlatform::new();
        for id in ["a", "b"] {
            platform.insert_group(GroupSnapshot {
                id: GroupId::from(id),
                name: id.to_uppercase(),
                roles: vec![RoleDef::new(format!("{id}-vip"), "VIP")],
            });
            platform
                .insert_member(&GroupId::from(id), SubjectId::from("s"), &[])
                .unwrap();
        }
        Arc::new(platform)
    }

    #[tokio::test]
    async fn outcome_summary_mentions_counts() {
        let home = TempDir::new().unwrap();
        let platform = two_group_platform();
        let store = Arc::new(IntentStore::open_at(home.path()).unwrap());
        store
            .upsert(&SubjectId::from("s"), &RoleName::from("VIP"))
            .unwrap();
        let engine = Reconciler::new(platform.clone(), platform, store);
        engine.rebuild_roles().await.unwrap();

        let outcome = engine.reconcile(&SubjectId::from("s")).await.unwrap();
        assert_eq!(
            outcome.summary(),
            "synced s across 2 group(s): 2 added, 0 removed"
        );
        assert!(!engine.guard().is_locked(&SubjectId::from("s")));
    }

    #[tokio::test]
    async fn held_guard_skips_without_touching_groups() {
        let home = TempDir::new().unwrap();
        let platform = two_group_platform();
        let store = Arc::new(IntentStore::open_at(home.path()).unwrap());
        let engine = Reconciler::new(platform.clone(), platform.clone(), store);

        let _ticket = engine.guard().acquire(&SubjectId::from("s")).unwrap();
        let outcome = engine.reconcile(&SubjectId::from("s")).await.unwrap();
        assert!(outcome.is_skipped());
        assert_eq!(platform.lookup_count(), 0);
    }

    #[test]
    fn skipped_outcome_serializes_with_status_tag() {
        let outcome = ReconcileOutcome::Skipped {
            subject: SubjectId::from("s"),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["subject"], "s");
    }
}
