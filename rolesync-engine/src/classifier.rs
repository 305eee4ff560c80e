//! Syncable role classifier.
//!
//! A role name is syncable when it appears in more than one group's catalog.
//! The set is rebuilt wholesale from a topology snapshot and published by
//! swapping an `Arc`, so readers always see either the old or the new map.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use rolesync_core::{GroupSnapshot, RoleDef, RoleName};

/// Role name → one representative role handle.
pub type SyncableMap = HashMap<RoleName, RoleDef>;

/// Shared, swappable Syncable Role Set.
#[derive(Debug, Clone, Default)]
pub struct SyncableRoles {
    inner: Arc<RwLock<Arc<SyncableMap>>>,
}

impl SyncableRoles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reclassify from `groups` and publish the result atomically.
    ///
    /// Returns the number of syncable names.
    pub async fn rebuild(&self, groups: &[GroupSnapshot]) -> usize {
        let next = Arc::new(classify(groups));
        let count = next.len();
        let mut guard = self.inner.write().await;
        *guard = next;
        tracing::debug!(syncable = count, groups = groups.len(), "syncable roles rebuilt");
        count
    }

    /// Current map; later rebuilds do not affect the returned snapshot.
    pub async fn snapshot(&self) -> Arc<SyncableMap> {
        self.inner.read().await.clone()
    }

    pub async fn contains(&self, name: &RoleName) -> bool {
        self.inner.read().await.contains_key(name)
    }

    /// Sorted syncable names.
    pub async fn names(&self) -> BTreeSet<RoleName> {
        self.inner.read().await.keys().cloned().collect()
    }
}

/// Names observed in more than one group, excluding the implicit "everyone" role.
///
/// A name counts once per group even if that group defines it twice.
pub fn classify(groups: &[GroupSnapshot]) -> SyncableMap {
    let mut counts: HashMap<&RoleName, usize> = HashMap::new();
    let mut representative: HashMap<&RoleName, &RoleDef> = HashMap::new();

    for group in groups {
        let mut seen: HashSet<&RoleName> = HashSet::new();
        for role in group.roles.iter().filter(|r| !r.everyone) {
            if !seen.insert(&role.name) {
                continue;
            }
            *counts.entry(&role.name).or_insert(0) += 1;
            representative.entry(&role.name).or_insert(role);
        }
    }

    counts
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .filter_map(|(name, _)| {
            representative
                .get(name)
                .map(|role| (name.clone(), (*role).clone()))
        })
        .collect()
}
