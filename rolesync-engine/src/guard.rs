//! Per-subject reconciliation guard.
//!
//! At most one pass per subject may run at a time. Acquisition never blocks
//! or queues: a second caller is simply told "no". The returned
//! [`GuardTicket`] releases the subject when dropped, so early returns, `?`
//! and panics all release.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rolesync_core::SubjectId;

#[derive(Debug, Clone, Default)]
pub struct ReconcileGuard {
    locked: Arc<Mutex<HashSet<SubjectId>>>,
}

impl ReconcileGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock `subject`, or return `false` immediately if it is already locked.
    ///
    /// Callers using this form must pair it with [`ReconcileGuard::release`].
    pub fn try_acquire(&self, subject: &SubjectId) -> bool {
        self.lock().insert(subject.clone())
    }

    /// Unlock `subject`. Safe to call when it was never acquired.
    pub fn release(&self, subject: &SubjectId) {
        self.lock().remove(subject);
    }

    /// Lock `subject` and return a ticket that releases it on drop.
    pub fn acquire(&self, subject: &SubjectId) -> Option<GuardTicket> {
        self.try_acquire(subject).then(|| GuardTicket {
            guard: self.clone(),
            subject: subject.clone(),
        })
    }

    pub fn is_locked(&self, subject: &SubjectId) -> bool {
        self.lock().contains(subject)
    }

    /// Subjects currently mid-pass.
    pub fn locked_subjects(&self) -> Vec<SubjectId> {
        let mut subjects: Vec<_> = self.lock().iter().cloned().collect();
        subjects.sort();
        subjects
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<SubjectId>> {
        self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Held for the duration of one pass.
#[derive(Debug)]
pub struct GuardTicket {
    guard: ReconcileGuard,
    subject: SubjectId,
}

impl GuardTicket {
    pub fn subject(&self) -> &SubjectId {
        &self.subject
    }
}

impl Drop for GuardTicket {
    fn drop(&mut self) {
        self.guard.release(&self.subject);
    }
}
