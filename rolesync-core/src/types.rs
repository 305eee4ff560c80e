//! Domain types shared by the store, the engine and the daemon.
//!
//! Platform objects are reduced to plain snapshots: a group is its id, name
//! and role catalog; a member is a subject id plus the roles it holds in one
//! group. Any chat-platform adapter converts its SDK objects into these.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identity of the user/member being reconciled.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectId(pub String);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of an independently administered group (guild).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for GroupId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for GroupId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Platform identifier of one role inside one group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleId(pub String);

impl fmt::Display for RoleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RoleId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoleId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Role name: the key roles are matched on across groups.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoleName(pub String);

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RoleName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RoleName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// One role definition in a group's catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDef {
    pub id: RoleId,
    pub name: RoleName,
    /// Membership is owned by an external integration; never mutated here.
    #[serde(default)]
    pub managed: bool,
    /// The universal implicit role every member holds.
    #[serde(default)]
    pub everyone: bool,
}

impl RoleDef {
    pub fn new(id: impl Into<RoleId>, name: impl Into<RoleName>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            managed: false,
            everyone: false,
        }
    }

    pub fn managed(mut self) -> Self {
        self.managed = true;
        self
    }

    pub fn everyone(mut self) -> Self {
        self.everyone = true;
        self
    }
}

/// A group's id, display name and role catalog at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub roles: Vec<RoleDef>,
}

impl GroupSnapshot {
    /// First role in this group carrying `name`.
    pub fn role_named(&self, name: &RoleName) -> Option<&RoleDef> {
        self.roles.iter().find(|r| &r.name == name)
    }
}

/// A subject's membership in one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberView {
    pub subject: SubjectId,
    /// Bot/integration account; excluded from bulk resets.
    #[serde(default)]
    pub automated: bool,
    #[serde(default)]
    pub roles: Vec<RoleDef>,
}

impl MemberView {
    pub fn role_names(&self) -> BTreeSet<RoleName> {
        self.roles.iter().map(|r| r.name.clone()).collect()
    }
}

/// A membership-change notification: role names held before and after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberUpdate {
    pub group: GroupId,
    pub subject: SubjectId,
    #[serde(default)]
    pub before: Vec<RoleName>,
    #[serde(default)]
    pub after: Vec<RoleName>,
}

impl MemberUpdate {
    /// Role names present in `after` but not in `before`.
    pub fn gained(&self) -> BTreeSet<RoleName> {
        let before: BTreeSet<_> = self.before.iter().collect();
        self.after
            .iter()
            .filter(|r| !before.contains(r))
            .cloned()
            .collect()
    }

    /// Role names present in `before` but not in `after`.
    pub fn lost(&self) -> BTreeSet<RoleName> {
        let after: BTreeSet<_> = self.after.iter().collect();
        self.before
            .iter()
            .filter(|r| !after.contains(r))
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
