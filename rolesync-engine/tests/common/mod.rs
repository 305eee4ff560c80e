//! Shared fixtures for engine integration tests.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use rolesync_core::{GroupId, GroupSnapshot, IntentStore, RoleDef, RoleName, SubjectId};
use rolesync_engine::{InMemoryPlatform, Reconciler};

/// Route engine logs to the test harness; `RUST_LOG=debug` shows guard and pass traces.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn s(id: &str) -> SubjectId {
    SubjectId::from(id)
}

pub fn r(name: &str) -> RoleName {
    RoleName::from(name)
}

pub fn g(id: &str) -> GroupId {
    GroupId::from(id)
}

pub fn names(list: &[&str]) -> BTreeSet<RoleName> {
    list.iter().map(|n| RoleName::from(*n)).collect()
}

/// Add group `id` whose roles get ids `<id>-<name>`, plus an `@everyone` role.
pub fn add_group(platform: &InMemoryPlatform, id: &str, roles: &[&str]) {
    let mut defs = vec![RoleDef::new(id, "@everyone").everyone()];
    defs.extend(roles.iter().map(|name| RoleDef::new(format!("{id}-{name}"), *name)));
    add_group_with(platform, id, defs);
}

pub fn add_group_with(platform: &InMemoryPlatform, id: &str, roles: Vec<RoleDef>) {
    platform.insert_group(GroupSnapshot {
        id: GroupId::from(id),
        name: id.to_uppercase(),
        roles,
    });
}

pub fn join(platform: &InMemoryPlatform, group: &str, subject: &str, roles: &[&str]) {
    platform
        .insert_member(&GroupId::from(group), SubjectId::from(subject), roles)
        .expect("insert member");
}

pub fn open_store(home: &Path) -> Arc<IntentStore> {
    Arc::new(IntentStore::open_at(home).expect("open intent store"))
}

/// Engine over `platform` with syncable roles already classified.
pub async fn engine_over(platform: Arc<InMemoryPlatform>, home: &Path) -> Arc<Reconciler> {
    let engine = Arc::new(Reconciler::new(
        platform.clone(),
        platform,
        open_store(home),
    ));
    engine.rebuild_roles().await.expect("classify roles");
    engine
}
