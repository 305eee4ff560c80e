//! Intent store: durable (subject, role-name) table.
//!
//! Persists an `IntentFile` JSON document at `<home>/.rolesync/intents.json`.
//! The full table is held in memory; every mutation runs as a transaction:
//!
//! 1. Clone the current table and apply the change to the clone.
//! 2. If nothing changed, return without touching disk.
//! 3. Serialize the clone to `<path>.tmp`, fsync it, then rename over `<path>`.
//! 4. Swap the clone in as the live table.
//!
//! A failure at step 3 leaves both the file and the live table at their
//! previous state. Writers are serialized by the table mutex.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{store_io_err, StoreError};
use crate::paths::intents_path;
use crate::types::{RoleName, SubjectId};

/// Current on-disk format version.
pub const INTENT_FILE_VERSION: u32 = 1;

/// In-memory intent table: subject → desired role names.
///
/// Subjects with an empty desired set are never stored.
pub type IntentTable = BTreeMap<SubjectId, BTreeSet<RoleName>>;

/// On-disk intent store payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntentFile {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub subjects: IntentTable,
}

/// Durable intent table shared by the listener, the engine and resets.
#[derive(Debug)]
pub struct IntentStore {
    path: PathBuf,
    table: Mutex<IntentTable>,
}

impl IntentStore {
    /// Open the store at `<home>/.rolesync/intents.json`.
    pub fn open_at(home: &Path) -> Result<Self, StoreError> {
        Self::open(intents_path(home))
    }

    /// Open the store backed by `path`.
    ///
    /// A missing file yields an empty store; the file is created on first write.
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let table = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|e| store_io_err(&path, e))?;
            let file: IntentFile = serde_json::from_str(&contents).map_err(|e| {
                StoreError::Parse {
                    path: path.clone(),
                    source: e,
                }
            })?;
            file.subjects
        } else {
            IntentTable::new()
        };
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record that `subject` should hold `role`. Returns `true` if the table changed.
    pub fn upsert(&self, subject: &SubjectId, role: &RoleName) -> Result<bool, StoreError> {
        self.transact(|table| {
            table
                .entry(subject.clone())
                .or_default()
                .insert(role.clone())
        })
    }

    /// Drop the (subject, role) intent. Removing an absent pair is a no-op.
    pub fn remove(&self, subject: &SubjectId, role: &RoleName) -> Result<bool, StoreError> {
        self.transact(|table| {
            let Some(roles) = table.get_mut(subject) else {
                return false;
            };
            let removed = roles.remove(role);
            if roles.is_empty() {
                table.remove(subject);
            }
            removed
        })
    }

    /// The subject's desired set; empty if the subject is unknown.
    pub fn list_roles(&self, subject: &SubjectId) -> BTreeSet<RoleName> {
        self.lock().get(subject).cloned().unwrap_or_default()
    }

    /// Replace the subject's entire desired set in one transaction.
    pub fn replace_all(
        &self,
        subject: &SubjectId,
        roles: BTreeSet<RoleName>,
    ) -> Result<bool, StoreError> {
        self.transact(|table| {
            let previous = if roles.is_empty() {
                table.remove(subject)
            } else {
                table.insert(subject.clone(), roles)
            };
            previous.unwrap_or_default() != table.get(subject).cloned().unwrap_or_default()
        })
    }

    /// All subjects with a non-empty desired set, sorted.
    pub fn subjects(&self) -> Vec<SubjectId> {
        self.lock().keys().cloned().collect()
    }

    /// Copy of the full table.
    pub fn snapshot(&self) -> IntentTable {
        self.lock().clone()
    }

    fn transact<F>(&self, apply: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut IntentTable) -> bool,
    {
        let mut live = self.lock();
        let mut next = live.clone();
        if !apply(&mut next) {
            return Ok(false);
        }
        save(&self.path, &next)?;
        *live = next;
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, IntentTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write `table` to `path` atomically via a `.tmp` sibling and rename.
fn save(path: &Path, table: &IntentTable) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Err(store_io_err(
            path,
            std::io::Error::other("invalid intent store path"),
        ));
    };
    std::fs::create_dir_all(dir).map_err(|e| store_io_err(dir, e))?;

    let file = IntentFile {
        version: INTENT_FILE_VERSION,
        updated_at: Utc::now(),
        subjects: table.clone(),
    };
    let json = serde_json::to_string_pretty(&file)?;
    let tmp = path.with_extension("json.tmp");
    write_synced(&tmp, json.as_bytes()).map_err(|e| store_io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(store_io_err(path, e));
    }
    sync_dir(dir);
    Ok(())
}

/// Write and flush `bytes` to stable storage before the rename publishes them.
fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Persist the rename itself. Best effort: not every platform can open a directory.
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
