//! Change listener (feedback-loop boundary) and administrator resets.

mod common;

use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::mpsc;

use rolesync_core::{
    GroupId, GroupSnapshot, IntentStore, MemberUpdate, MemberView, RoleDef, SubjectId,
};
use rolesync_engine::{
    ChangeListener, GroupCatalog, InMemoryPlatform, ListenerOutcome, MembershipMutator,
    PlatformError, RatePolicy, Reconciler, ResetService, RoleAction, SyncError,
};

use common::*;

fn update(group: &str, subject: &str, before: &[&str], after: &[&str]) -> MemberUpdate {
    MemberUpdate {
        group: g(group),
        subject: s(subject),
        before: before.iter().map(|n| r(n)).collect(),
        after: after.iter().map(|n| r(n)).collect(),
    }
}

// ---------------------------------------------------------------------------
// 1. Listener scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gaining_a_single_group_role_changes_nothing() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "a", &["VIP"]);
    add_group(&platform, "b", &["Mod"]);
    join(&platform, "a", "s", &[]);
    join(&platform, "b", "s", &[]);
    let engine = engine_over(platform.clone(), home.path()).await;
    let listener = ChangeListener::new(engine.clone());

    let outcome = listener
        .handle(update("a", "s", &[], &["VIP"]))
        .await
        .unwrap();
    assert_eq!(outcome, ListenerOutcome::Ignored { subject: s("s") });
    assert!(engine.store().list_roles(&s("s")).is_empty());
    assert_eq!(platform.lookup_count(), 0, "no reconciliation pass may run");
}

#[tokio::test]
async fn gaining_a_shared_role_records_intent_and_propagates() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "a", &["VIP"]);
    add_group(&platform, "b", &["VIP"]);
    add_group(&platform, "c", &["VIP"]);
    join(&platform, "a", "s", &["VIP"]);
    join(&platform, "b", "s", &[]);
    let engine = engine_over(platform.clone(), home.path()).await;
    let listener = ChangeListener::new(engine.clone());

    let outcome = listener
        .handle(update("a", "s", &[], &["VIP"]))
        .await
        .unwrap();
    let ListenerOutcome::Recorded {
        gained, reconcile, ..
    } = outcome
    else {
        panic!("expected Recorded, got {outcome:?}");
    };
    assert_eq!(gained, names(&["VIP"]));
    let report = reconcile.expect("pass ran").report().cloned().expect("completed");
    assert_eq!(report.not_member, vec![g("c")]);

    assert_eq!(engine.store().list_roles(&s("s")), names(&["VIP"]));
    assert_eq!(platform.held_roles(&g("b"), &s("s")).unwrap(), names(&["VIP"]));
}

#[tokio::test]
async fn losing_a_shared_role_removes_it_everywhere() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "a", &["VIP", "Mod"]);
    add_group(&platform, "b", &["VIP", "Mod"]);
    join(&platform, "a", "s", &["Mod"]);
    join(&platform, "b", "s", &["VIP", "Mod"]);
    let engine = engine_over(platform.clone(), home.path()).await;
    engine
        .store()
        .replace_all(&s("s"), names(&["VIP", "Mod"]))
        .unwrap();
    let listener = ChangeListener::new(engine.clone());

    listener
        .handle(update("a", "s", &["VIP", "Mod"], &["Mod"]))
        .await
        .unwrap();

    assert_eq!(engine.store().list_roles(&s("s")), names(&["Mod"]));
    assert_eq!(platform.held_roles(&g("b"), &s("s")).unwrap(), names(&["Mod"]));
}

#[tokio::test]
async fn many_role_diffs_collapse_into_one_pass() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "a", &["VIP", "Mod", "Dev"]);
    add_group(&platform, "b", &["VIP", "Mod", "Dev"]);
    join(&platform, "a", "s", &["VIP", "Mod", "Dev"]);
    join(&platform, "b", "s", &[]);
    let engine = engine_over(platform.clone(), home.path()).await;
    let listener = ChangeListener::new(engine.clone());

    listener
        .handle(update("a", "s", &[], &["VIP", "Mod", "Dev"]))
        .await
        .unwrap();

    // One pass looks the subject up once per group.
    assert_eq!(platform.lookup_count(), 2);
    assert_eq!(
        platform.held_roles(&g("b"), &s("s")).unwrap(),
        names(&["Dev", "Mod", "VIP"])
    );
}

#[tokio::test]
async fn notifications_for_a_locked_subject_are_dropped() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "a", &["VIP"]);
    add_group(&platform, "b", &["VIP"]);
    let engine = engine_over(platform.clone(), home.path()).await;
    let listener = ChangeListener::new(engine.clone());

    let _ticket = engine.guard().acquire(&s("s")).unwrap();
    let outcome = listener
        .handle(update("a", "s", &[], &["VIP"]))
        .await
        .unwrap();
    assert_eq!(outcome, ListenerOutcome::Suppressed { subject: s("s") });
    assert!(engine.store().list_roles(&s("s")).is_empty());
}

// ---------------------------------------------------------------------------
// 2. Feedback loop
// ---------------------------------------------------------------------------

/// Delivers every echo of the engine's own writes to the listener while the
/// pass is still running, the way a live gateway would.
struct EchoingPlatform {
    inner: Arc<InMemoryPlatform>,
    echoes: Mutex<mpsc::UnboundedReceiver<MemberUpdate>>,
    listener: OnceLock<ChangeListener>,
    outcomes: Mutex<Vec<ListenerOutcome>>,
}

impl EchoingPlatform {
    async fn deliver_echoes(&self) {
        let pending: Vec<MemberUpdate> = {
            let mut rx = self.echoes.lock().unwrap();
            std::iter::from_fn(|| rx.try_recv().ok()).collect()
        };
        let Some(listener) = self.listener.get() else {
            return;
        };
        for echo in pending {
            let outcome = listener.handle(echo).await.expect("listener");
            self.outcomes.lock().unwrap().push(outcome);
        }
    }
}

#[async_trait]
impl GroupCatalog for EchoingPlatform {
    async fn groups(&self) -> Result<Vec<GroupSnapshot>, PlatformError> {
        self.inner.groups().await
    }

    async fn member(
        &self,
        group: &GroupId,
        subject: &SubjectId,
    ) -> Result<MemberView, PlatformError> {
        self.inner.member(group, subject).await
    }

    async fn members(&self, group: &GroupId) -> Result<Vec<MemberView>, PlatformError> {
        self.inner.members(group).await
    }
}

#[async_trait]
impl MembershipMutator for EchoingPlatform {
    async fn add_role(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
    ) -> Result<(), PlatformError> {
        self.inner.add_role(group, subject, role).await?;
        self.deliver_echoes().await;
        Ok(())
    }

    async fn remove_role(
        &self,
        group: &GroupId,
        subject: &SubjectId,
        role: &RoleDef,
    ) -> Result<(), PlatformError> {
        self.inner.remove_role(group, subject, role).await?;
        self.deliver_echoes().await;
        Ok(())
    }
}

#[tokio::test]
async fn engine_writes_echoed_mid_pass_are_discarded() {
    init_tracing();
    let home = TempDir::new().unwrap();
    let inner = Arc::new(InMemoryPlatform::new());
    add_group(&inner, "a", &["VIP", "Old"]);
    add_group(&inner, "b", &["VIP", "Old"]);
    add_group(&inner, "c", &["VIP", "Old"]);
    join(&inner, "a", "s", &["VIP"]);
    join(&inner, "b", "s", &["Old"]);
    join(&inner, "c", "s", &["Old"]);

    let echoes = inner.subscribe();
    let echoing = Arc::new(EchoingPlatform {
        inner: inner.clone(),
        echoes: Mutex::new(echoes),
        listener: OnceLock::new(),
        outcomes: Mutex::new(Vec::new()),
    });
    let store = Arc::new(IntentStore::open_at(home.path()).unwrap());
    let engine = Arc::new(Reconciler::new(echoing.clone(), echoing.clone(), store));
    engine.rebuild_roles().await.unwrap();
    let listener = ChangeListener::new(engine.clone());
    assert!(echoing.listener.set(listener.clone()).is_ok());
    engine.store().upsert(&s("s"), &r("VIP")).unwrap();

    let outcome = engine.reconcile(&s("s")).await.unwrap();
    let report = outcome.report().unwrap();
    // b and c: add VIP, remove Old.
    assert_eq!(report.applied.len(), 4);

    let outcomes = echoing.outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 4, "every write is echoed");
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, ListenerOutcome::Suppressed { .. })));
    assert_eq!(engine.store().list_roles(&s("s")), names(&["VIP"]));
    // One pass: one lookup per group.
    assert_eq!(inner.lookup_count(), 3);
}

#[tokio::test]
async fn echoes_arriving_after_the_pass_do_not_retrigger() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "a", &["VIP"]);
    add_group(&platform, "b", &["VIP"]);
    join(&platform, "a", "s", &["VIP"]);
    join(&platform, "b", "s", &[]);
    let mut echoes = platform.subscribe();
    let engine = engine_over(platform.clone(), home.path()).await;
    let listener = ChangeListener::new(engine.clone());

    let human = platform.edit_member(&g("a"), &s("s"), &["VIP"]).unwrap();
    let _ = echoes.try_recv();
    listener.handle(human).await.unwrap();
    let lookups_after_pass = platform.lookup_count();

    let echo = echoes.try_recv().expect("grant in b is echoed");
    let outcome = listener.handle(echo).await.unwrap();
    let ListenerOutcome::Recorded { reconcile, .. } = outcome else {
        panic!("expected Recorded, got {outcome:?}");
    };
    assert!(reconcile.is_none(), "store already matched; no second pass");
    assert_eq!(platform.lookup_count(), lookups_after_pass);
}

// ---------------------------------------------------------------------------
// 3. Explicit resets
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_replaces_desired_set_from_primary() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "p", &["VIP", "Mod", "Old"]);
    add_group(&platform, "x", &["VIP", "Mod", "Old"]);
    join(&platform, "p", "s", &["VIP", "Mod"]);
    join(&platform, "x", "s", &["VIP", "Old"]);
    let engine = engine_over(platform.clone(), home.path()).await;
    engine
        .store()
        .replace_all(&s("s"), names(&["VIP", "Old"]))
        .unwrap();

    let resets = ResetService::new(engine.clone(), Some(g("p")));
    let report = resets.reset_subject(&s("s")).await.unwrap();

    assert_eq!(report.desired, names(&["Mod", "VIP"]));
    assert!(report.intent_changed);
    assert_eq!(engine.store().list_roles(&s("s")), names(&["Mod", "VIP"]));
    assert_eq!(platform.held_roles(&g("x"), &s("s")).unwrap(), names(&["Mod", "VIP"]));
    let pass = report.outcome.report().unwrap();
    assert_eq!(pass.count(RoleAction::Add), 1);
    assert_eq!(pass.count(RoleAction::Remove), 1);
}

#[tokio::test]
async fn reset_without_primary_is_a_configuration_error() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    let engine = engine_over(platform.clone(), home.path()).await;

    let err = ResetService::new(engine.clone(), None)
        .reset_subject(&s("s"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Configuration(_)), "got: {err}");

    let err = ResetService::new(engine, Some(g("gone")))
        .reset_subject(&s("s"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Configuration(_)), "got: {err}");
    assert_eq!(platform.mutation_count(), 0);
}

#[tokio::test]
async fn reset_for_non_member_is_rejected() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "p", &["VIP"]);
    add_group(&platform, "x", &["VIP"]);
    join(&platform, "x", "s", &["VIP"]);
    let engine = engine_over(platform.clone(), home.path()).await;
    engine.store().upsert(&s("s"), &r("VIP")).unwrap();

    let err = ResetService::new(engine.clone(), Some(g("p")))
        .reset_subject(&s("s"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotAMember { .. }), "got: {err}");
    assert_eq!(engine.store().list_roles(&s("s")), names(&["VIP"]));
}

#[tokio::test]
async fn storage_failure_aborts_reset_and_releases_subject() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "p", &["VIP"]);
    add_group(&platform, "x", &["VIP"]);
    join(&platform, "p", "s", &["VIP"]);
    join(&platform, "x", "s", &[]);

    let blocker = home.path().join("blocker");
    std::fs::write(&blocker, b"file").unwrap();
    let store = Arc::new(IntentStore::open(blocker.join("intents.json")).unwrap());
    let engine = Arc::new(Reconciler::new(platform.clone(), platform.clone(), store));
    engine.rebuild_roles().await.unwrap();

    let err = ResetService::new(engine.clone(), Some(g("p")))
        .reset_subject(&s("s"))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)), "got: {err}");
    assert_eq!(platform.mutation_count(), 0);
    assert!(!engine.guard().is_locked(&s("s")));

    let err = ChangeListener::new(engine.clone())
        .handle(update("p", "s", &[], &["VIP"]))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Storage(_)), "got: {err}");
}

#[tokio::test(start_paused = true)]
async fn reset_all_paces_calls_skips_bots_and_survives_failures() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "p", &["VIP"]);
    add_group(&platform, "x", &["VIP"]);
    for subject in ["u1", "u2", "u3"] {
        join(&platform, "p", subject, &["VIP"]);
        join(&platform, "x", subject, &[]);
    }
    join(&platform, "p", "bot", &["VIP"]);
    platform.mark_automated(&g("p"), &s("bot"));
    let engine = engine_over(platform.clone(), home.path()).await;

    // Every grant in x fails; each pass is partial but the bulk run continues.
    platform.fail_role(
        &g("x"),
        &r("VIP"),
        PlatformError::Permission("missing manage_roles".into()),
    );

    let (tx, mut rx) = mpsc::channel(16);
    let started = tokio::time::Instant::now();
    let summary = ResetService::new(engine.clone(), Some(g("p")))
        .reset_all(RatePolicy::every(Duration::from_secs(2)), Some(tx))
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_secs(4), "three calls, two gaps");
    assert_eq!(summary.total, 3);
    assert_eq!(summary.succeeded, 3);
    assert!(summary.results.iter().all(|r| r.message.contains("1 failed")));
    assert!(summary.results.iter().all(|r| r.subject != s("bot")));
    assert!(engine.store().list_roles(&s("bot")).is_empty());

    let mut seen = Vec::new();
    while let Ok(progress) = rx.try_recv() {
        seen.push(progress.done);
        assert_eq!(progress.total, 3);
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

#[tokio::test]
async fn reset_all_reports_per_subject_failures() {
    let home = TempDir::new().unwrap();
    let platform = Arc::new(InMemoryPlatform::new());
    add_group(&platform, "p", &["VIP"]);
    add_group(&platform, "x", &["VIP"]);
    join(&platform, "p", "u1", &["VIP"]);
    join(&platform, "p", "u2", &["VIP"]);
    join(&platform, "x", "u1", &[]);
    join(&platform, "x", "u2", &[]);
    let engine = engine_over(platform.clone(), home.path()).await;

    // u1 is mid-pass elsewhere: its reset still succeeds with a "skipped" message.
    let _held = engine.guard().acquire(&s("u1")).unwrap();
    let summary = ResetService::new(engine.clone(), Some(g("p")))
        .reset_all(RatePolicy::unlimited(), None)
        .await
        .unwrap();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.failed, 0);
    let u1 = summary.results.iter().find(|r| r.subject == s("u1")).unwrap();
    assert!(u1.message.contains("already in progress"));
    assert_eq!(platform.held_roles(&g("x"), &s("u2")).unwrap(), names(&["VIP"]));
}
