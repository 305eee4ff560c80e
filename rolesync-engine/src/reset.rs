//! Administrator-triggered resets from the primary (source-of-truth) group.
//!
//! `reset_subject` is the only path that replaces a subject's desired set
//! wholesale: it reads the subject's syncable roles in the primary group,
//! installs them with `replace_all`, then reconciles. `reset_all` walks every
//! human member of the primary group one at a time, paced by a
//! [`RatePolicy`], and never stops on an individual failure.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use rolesync_core::{GroupId, RoleName, SubjectId};

use crate::engine::{ReconcileOutcome, Reconciler};
use crate::error::SyncError;
use crate::platform::{bounded, PlatformError};

/// Pacing for bulk resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatePolicy {
    interval: Duration,
}

impl RatePolicy {
    /// At most `calls_per_second` resets per second. Non-positive values disable pacing.
    pub fn per_second(calls_per_second: f64) -> Self {
        if !calls_per_second.is_finite() || calls_per_second <= 0.0 {
            return Self::unlimited();
        }
        Self {
            interval: Duration::from_secs_f64(1.0 / calls_per_second),
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn unlimited() -> Self {
        Self {
            interval: Duration::ZERO,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

/// Result of one explicit reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub subject: SubjectId,
    /// Desired set installed from the primary group.
    pub desired: BTreeSet<RoleName>,
    pub intent_changed: bool,
    pub outcome: ReconcileOutcome,
}

/// Per-subject line of a bulk reset: success flag plus a readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubjectResult {
    pub subject: SubjectId,
    pub success: bool,
    pub message: String,
}

/// Emitted after each subject during `reset_all`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetProgress {
    pub done: usize,
    pub total: usize,
    pub result: SubjectResult,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetAllSummary {
    pub primary: GroupId,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<SubjectResult>,
    pub duration_ms: u128,
}

#[derive(Clone)]
pub struct ResetService {
    engine: Arc<Reconciler>,
    primary: Option<GroupId>,
}

impl ResetService {
    pub fn new(engine: Arc<Reconciler>, primary: Option<GroupId>) -> Self {
        Self { engine, primary }
    }

    pub fn primary(&self) -> Option<&GroupId> {
        self.primary.as_ref()
    }

    /// Rebuild `subject`'s desired set from the primary group and reconcile.
    pub async fn reset_subject(&self, subject: &SubjectId) -> Result<ResetReport, SyncError> {
        let primary = self.require_primary()?;
        let timeout = self.engine.call_timeout();

        let member = match bounded(timeout, self.engine.catalog().member(primary, subject)).await {
            Ok(member) => member,
            Err(PlatformError::NotFound) => {
                return Err(SyncError::NotAMember {
                    group: primary.clone(),
                    subject: subject.clone(),
                })
            }
            Err(err) => return Err(primary_error(primary, err)),
        };

        let syncable = self.engine.roles().snapshot().await;
        let desired: BTreeSet<RoleName> = member
            .role_names()
            .into_iter()
            .filter(|name| syncable.contains_key(name))
            .collect();

        let intent_changed = {
            let subject = subject.clone();
            let desired = desired.clone();
            self.engine
                .with_store(move |store| store.replace_all(&subject, desired))
                .await?
        };
        tracing::info!(
            subject = %subject,
            primary = %primary,
            desired = desired.len(),
            intent_changed,
            "reset desired roles from primary group",
        );

        let outcome = self.engine.reconcile(subject).await?;
        Ok(ResetReport {
            subject: subject.clone(),
            desired,
            intent_changed,
            outcome,
        })
    }

    /// Reset every non-automated member of the primary group, sequentially.
    pub async fn reset_all(
        &self,
        policy: RatePolicy,
        progress: Option<mpsc::Sender<ResetProgress>>,
    ) -> Result<ResetAllSummary, SyncError> {
        let primary = self.require_primary()?;
        let started = Instant::now();

        let members = bounded(
            self.engine.call_timeout(),
            self.engine.catalog().members(primary),
        )
        .await
        .map_err(|err| primary_error(primary, err))?;
        let subjects: Vec<SubjectId> = members
            .into_iter()
            .filter(|m| !m.automated)
            .map(|m| m.subject)
            .collect();
        let total = subjects.len();
        tracing::info!(primary = %primary, total, "starting bulk reset");

        let mut ticker = (!policy.interval().is_zero()).then(|| {
            let mut ticker = tokio::time::interval(policy.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        let mut results = Vec::with_capacity(total);
        for (index, subject) in subjects.into_iter().enumerate() {
            if let Some(ticker) = ticker.as_mut() {
                ticker.tick().await;
            }

            let result = match self.reset_subject(&subject).await {
                Ok(report) => SubjectResult {
                    subject,
                    success: true,
                    message: report.outcome.summary(),
                },
                Err(err) => {
                    tracing::warn!(subject = %subject, error = %err, "bulk reset entry failed");
                    SubjectResult {
                        subject,
                        success: false,
                        message: err.to_string(),
                    }
                }
            };

            if let Some(tx) = &progress {
                let _ = tx
                    .send(ResetProgress {
                        done: index + 1,
                        total,
                        result: result.clone(),
                    })
                    .await;
            }
            results.push(result);
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let summary = ResetAllSummary {
            primary: primary.clone(),
            total,
            succeeded,
            failed: total - succeeded,
            results,
            duration_ms: started.elapsed().as_millis(),
        };
        tracing::info!(
            primary = %primary,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "bulk reset finished",
        );
        Ok(summary)
    }

    fn require_primary(&self) -> Result<&GroupId, SyncError> {
        self.primary
            .as_ref()
            .ok_or_else(|| SyncError::Configuration("primary group is not configured".to_string()))
    }
}

fn primary_error(primary: &GroupId, err: PlatformError) -> SyncError {
    match err {
        PlatformError::UnknownGroup(_) => {
            SyncError::Configuration(format!("primary group {primary} is not accessible"))
        }
        other => SyncError::Platform(other),
    }
}
