//! Change listener: the feedback-loop boundary.
//!
//! Every grant/revoke the engine issues comes back as a membership-change
//! notification. Notifications for a subject whose pass is in flight are
//! discarded outright; everything else is diffed, filtered down to syncable
//! role names, written to the intent store, and collapsed into at most one
//! reconciliation pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use rolesync_core::{MemberUpdate, RoleName, SubjectId};

use crate::engine::{ReconcileOutcome, Reconciler};
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ListenerOutcome {
    /// The subject was mid-pass; the notification was dropped.
    Suppressed { subject: SubjectId },
    /// No syncable role was gained or lost.
    Ignored { subject: SubjectId },
    /// Syncable changes were written to the store.
    Recorded {
        subject: SubjectId,
        gained: BTreeSet<RoleName>,
        lost: BTreeSet<RoleName>,
        /// `None` when the store already matched, so no pass was needed.
        reconcile: Option<ReconcileOutcome>,
    },
}

#[derive(Clone)]
pub struct ChangeListener {
    engine: Arc<Reconciler>,
}

impl ChangeListener {
    pub fn new(engine: Arc<Reconciler>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<Reconciler> {
        &self.engine
    }

    /// Process one membership-change notification.
    pub async fn handle(&self, update: MemberUpdate) -> Result<ListenerOutcome, SyncError> {
        let subject = update.subject.clone();
        if self.engine.guard().is_locked(&subject) {
            tracing::debug!(
                subject = %subject,
                group = %update.group,
                "subject mid-reconciliation; dropping notification",
            );
            return Ok(ListenerOutcome::Suppressed { subject });
        }

        let syncable = self.engine.roles().snapshot().await;
        let gained: BTreeSet<RoleName> = update
            .gained()
            .into_iter()
            .filter(|r| syncable.contains_key(r))
            .collect();
        let lost: BTreeSet<RoleName> = update
            .lost()
            .into_iter()
            .filter(|r| syncable.contains_key(r))
            .collect();

        if gained.is_empty() && lost.is_empty() {
            return Ok(ListenerOutcome::Ignored { subject });
        }

        let changed = {
            let subject = subject.clone();
            let gained = gained.clone();
            let lost = lost.clone();
            self.engine
                .with_store(move |store| {
                    let mut changed = false;
                    for role in &gained {
                        changed |= store.upsert(&subject, role)?;
                    }
                    for role in &lost {
                        changed |= store.remove(&subject, role)?;
                    }
                    Ok(changed)
                })
                .await?
        };

        tracing::info!(
            subject = %subject,
            group = %update.group,
            gained = gained.len(),
            lost = lost.len(),
            changed,
            "recorded syncable role change",
        );

        let reconcile = if changed {
            Some(self.engine.reconcile(&subject).await?)
        } else {
            None
        };

        Ok(ListenerOutcome::Recorded {
            subject,
            gained,
            lost,
            reconcile,
        })
    }
}
