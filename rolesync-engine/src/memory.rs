//! In-process platform adapter backed by a YAML topology snapshot.
//!
//! ```yaml
//! groups:
//!   - id: "100"
//!     name: Primary
//!     roles:
//!       - { id: "100", name: "@everyone", everyone: true }
//!       - { id: "r-vip", name: VIP }
//!       - { id: "r-bot", name: Bots, managed: true }
//!     members:
//!       - { subject: "4242", roles: [VIP] }
//!       - { subject: "9000", automated: true, roles: [Bots] }
//! ```
//!
//! Every successful grant or revoke is echoed as a [`MemberUpdate`] to the
//! subscriber, exactly like a live platform would notify about the bot's own
//! writes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use rolesync_core::{
    GroupId, GroupSnapshot, MemberUpdate, MemberView, RoleDef, RoleId, RoleName, SubjectId,
};

use crate::platform::{GroupCatalog, MembershipMutator, PlatformError};

// ---------------------------------------------------------------------------
// Topology file
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse topology at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid topology: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub groups: Vec<TopologyGroup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyGroup {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<RoleDef>,
    #[serde(default)]
    pub members: Vec<TopologyMember>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyMember {
    pub subject: SubjectId,
    #[serde(default)]
    pub automated: bool,
    /// Role names held in this group.
    #[serde(default)]
    pub roles: Vec<RoleName>,
}

impl Topology {
    /// Load a topology file. A missing file is an empty topology.
    pub fn load(path: &Path) -> Result<Self, TopologyError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| TopologyError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_yaml::from_str(&contents).map_err(|e| TopologyError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

// ---------------------------------------------------------------------------
// Platform state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct GroupState {
    snapshot: GroupSnapshot,
    members: BTreeMap<SubjectId, MemberState>,
}

#[derive(Debug, Default)]
struct MemberState {
    automated: bool,
    roles: Vec<RoleId>,
}

#[derive(Debug, Default)]
struct State {
    groups: BTreeMap<GroupId, GroupState>,
    failures: HashMap<(GroupId, RoleName), PlatformError>,
    mutations: usize,
    lookups: usize,
    events: Option<mpsc::UnboundedSender<MemberUpdate>>,
}

impl GroupState {
    fn view(&self, subject: &SubjectId, member: &MemberState) -> MemberView {
        let roles = member
            .roles
            .iter()
            .filter_map(|id| self.snapshot.roles.iter().find(|r| &r.id == id))
            .cloned()
            .collect();
        MemberView {
            subject: subject.clone(),
            automated: member.automated,
            roles,
        }
    }

    fn role_names(&self, member: &MemberState) -> Vec<RoleName> {
        member
            .roles
            .iter()
            .filter_map(|id| self.snapshot.roles.iter().find(|r| &r.id == id))
            .map(|r| r.name.clone())
            .collect()
    }
}

/// Shared-state platform used by the daemon and by tests.
#[derive(Debug, Default)]
pub struct InMemoryPlatform {
    state: Mutex<State>,
}

impl InMemoryPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a platform from a parsed topology.
    pub fn from_topology(topology: Topology) -> Result<Self, TopologyError> {
        let platform = Self::new();
        for group in topology.groups {
            let id = group.id.clone();
            platform.insert_group(GroupSnapshot {
                id: group.id,
                name: group.name,
                roles: group.roles,
            });
            for member in group.members {
                let names: Vec<&str> = member.roles.iter().map(|r| r.0.as_str()).collect();
                platform
                    .insert_member(&id, member.subject.clone(), &names)
                    .map_err(|e| {
                        TopologyError::Invalid(format!(
                            "member {} of group {id}: {e}",
                            member.subject
                        ))
                    })?;
                if member.automated {
                    platform.mark_automated(&id, &member.subject);
                }
            }
        }
        Ok(platform)
    }

    /// Add or replace a group and its role catalog (members are kept).
    pub fn insert_group(&self, snapshot: GroupSnapshot) {
        let mut state = self.lock();
        let id = snapshot.id.clone();
        if let Some(existing) = state.groups.get_mut(&id) {
            existing.snapshot = snapshot;
            return;
        }
        state.groups.insert(
            id,
            GroupState {
                snapshot,
                members: BTreeMap::new(),
            },
        );
    }

    /// Add a member holding the named roles. Does not emit a notification.
    pub fn insert_member(
        &self,
        group: &GroupId,
        subject: SubjectId,
        role_names: &[&str],
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| PlatformError::UnknownGroup(group.clone()))?;
        let mut roles = Vec::with_capacity(role_names.len());
        for name in role_names {
            let role = group_state
                .snapshot
                .role_named(&RoleName::from(*name))
                .ok_or_else(|| PlatformError::Transport(format!("unknown role '{name}'")))?;
            roles.push(role.id.clone());
        }
        group_state.members.insert(
            subject,
            MemberState {
                automated: false,
                roles,
            },
        );
        Ok(())
    }

    pub fn mark_automated(&self, group: &GroupId, subject: &SubjectId) {
        let mut state = self.lock();
        if let Some(member) = state
            .groups
            .get_mut(group)
            .and_then(|g| g.members.get_mut(subject))
        {
            member.automated = true;
        }
    }

    /// Simulate a human edit: set the member's roles by name and notify the
    /// subscriber with the before/after diff.
    pub fn edit_member(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role_names: &[&str],
    ) -> Result<MemberUpdate, PlatformError> {
        let mut state = self.lock();
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| PlatformError::UnknownGroup(group.clone()))?;
        let mut roles = Vec::with_capacity(role_names.len());
        let mut after = Vec::with_capacity(role_names.len());
        for name in role_names {
            let role = group_state
                .snapshot
                .role_named(&RoleName::from(*name))
                .ok_or_else(|| PlatformError::Transport(format!("unknown role '{name}'")))?;
            roles.push(role.id.clone());
            after.push(role.name.clone());
        }
        let before = match group_state.members.get(subject) {
            Some(member) => group_state.role_names(member),
            None => return Err(PlatformError::NotFound),
        };
        if let Some(member) = group_state.members.get_mut(subject) {
            member.roles = roles;
        }

        let update = MemberUpdate {
            group: group.clone(),
            subject: subject.clone(),
            before,
            after,
        };
        emit(&mut state, update.clone());
        Ok(update)
    }

    /// Route every subsequent membership change to the returned receiver.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MemberUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().events = Some(tx);
        rx
    }

    /// Make every add/remove of `role` in `group` fail with `error`.
    pub fn fail_role(&self, group: &GroupId, role: &RoleName, error: PlatformError) {
        self.lock()
            .failures
            .insert((group.clone(), role.clone()), error);
    }

    /// Role names the subject currently holds in `group`, or `None` if not a member.
    pub fn held_roles(&self, group: &GroupId, subject: &SubjectId) -> Option<BTreeSet<RoleName>> {
        let state = self.lock();
        let group_state = state.groups.get(group)?;
        let member = group_state.members.get(subject)?;
        Some(group_state.role_names(member).into_iter().collect())
    }

    /// Successful add/remove calls so far.
    pub fn mutation_count(&self) -> usize {
        self.lock().mutations
    }

    /// `member` lookups so far, successful or not.
    pub fn lookup_count(&self) -> usize {
        self.lock().lookups
    }

    fn mutate(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
        grant: bool,
    ) -> Result<(), PlatformError> {
        let mut state = self.lock();
        if let Some(err) = state.failures.get(&(group.clone(), role.name.clone())) {
            return Err(err.clone());
        }
        let group_state = state
            .groups
            .get_mut(group)
            .ok_or_else(|| PlatformError::UnknownGroup(group.clone()))?;
        if !group_state.snapshot.roles.iter().any(|r| r.id == role.id) {
            return Err(PlatformError::Transport(format!(
                "role {} does not exist in group {group}",
                role.id
            )));
        }
        let member = group_state
            .members
            .get(subject)
            .ok_or(PlatformError::NotFound)?;
        let before = group_state.role_names(member);
        let held = member.roles.contains(&role.id);

        let changed = match (grant, held) {
            (true, false) => {
                if let Some(member) = group_state.members.get_mut(subject) {
                    member.roles.push(role.id.clone());
                }
                true
            }
            (false, true) => {
                if let Some(member) = group_state.members.get_mut(subject) {
                    member.roles.retain(|id| id != &role.id);
                }
                true
            }
            _ => false,
        };

        let after = group_state
            .members
            .get(subject)
            .map(|m| group_state.role_names(m))
            .unwrap_or_default();
        state.mutations += 1;
        if changed {
            emit(
                &mut state,
                MemberUpdate {
                    group: group.clone(),
                    subject: subject.clone(),
                    before,
                    after,
                },
            );
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn emit(state: &mut State, update: MemberUpdate) {
    let closed = match &state.events {
        Some(tx) => tx.send(update).is_err(),
        None => false,
    };
    if closed {
        state.events = None;
    }
}

#[async_trait]
impl GroupCatalog for InMemoryPlatform {
    async fn groups(&self) -> Result<Vec<GroupSnapshot>, PlatformError> {
        Ok(self
            .lock()
            .groups
            .values()
            .map(|g| g.snapshot.clone())
            .collect())
    }

    async fn member(
        &self,
        group: &GroupId,
        subject: &SubjectId,
    ) -> Result<MemberView, PlatformError> {
        let mut state = self.lock();
        state.lookups += 1;
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| PlatformError::UnknownGroup(group.clone()))?;
        let member = group_state
            .members
            .get(subject)
            .ok_or(PlatformError::NotFound)?;
        Ok(group_state.view(subject, member))
    }

    async fn members(&self, group: &GroupId) -> Result<Vec<MemberView>, PlatformError> {
        let state = self.lock();
        let group_state = state
            .groups
            .get(group)
            .ok_or_else(|| PlatformError::UnknownGroup(group.clone()))?;
        Ok(group_state
            .members
            .iter()
            .map(|(subject, member)| group_state.view(subject, member))
            .collect())
    }
}

#[async_trait]
impl MembershipMutator for InMemoryPlatform {
    async fn add_role(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
    ) -> Result<(), PlatformError> {
        self.mutate(group, subject, role, true)
    }

    async fn remove_role(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
    ) -> Result<(), PlatformError> {
        self.mutate(group, subject, role, false)
    }
}
