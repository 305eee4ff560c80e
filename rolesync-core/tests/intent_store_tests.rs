//! Intent store durability and on-disk format integration tests.
//! Storage layout: ~/.rolesync/intents.json

use std::collections::BTreeSet;

use assert_fs::prelude::*;
use predicates::prelude::predicate;
use rolesync_core::{
    intent_store::{IntentFile, INTENT_FILE_VERSION},
    paths, IntentStore, RoleName, StoreError, SubjectId,
};

fn subject() -> SubjectId {
    SubjectId::from("4242")
}

fn role(name: &str) -> RoleName {
    RoleName::from(name)
}

// ---------------------------------------------------------------------------
// 1. On-disk format
// ---------------------------------------------------------------------------

#[test]
fn first_write_creates_versioned_json_document() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = IntentStore::open_at(home.path()).expect("open");
    store.upsert(&subject(), &role("VIP")).expect("upsert");

    let file = home.child(".rolesync").child("intents.json");
    file.assert(predicate::path::exists());
    file.assert(predicate::str::contains("\"4242\""));
    file.assert(predicate::str::contains("\"VIP\""));

    let parsed: IntentFile =
        serde_json::from_str(&std::fs::read_to_string(file.path()).expect("read"))
            .expect("parse");
    assert_eq!(parsed.version, INTENT_FILE_VERSION);
    assert_eq!(
        parsed.subjects.get(&subject()),
        Some(&BTreeSet::from([role("VIP")]))
    );
}

#[test]
fn noop_mutations_do_not_create_the_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let store = IntentStore::open_at(home.path()).expect("open");
    assert!(!store.remove(&subject(), &role("VIP")).expect("remove"));
    assert!(!store
        .replace_all(&subject(), BTreeSet::new())
        .expect("replace"));
    home.child(".rolesync")
        .child("intents.json")
        .assert(predicate::path::missing());
}

// ---------------------------------------------------------------------------
// 2. Durability across restarts
// ---------------------------------------------------------------------------

#[test]
fn replace_all_is_visible_after_reopen() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    {
        let store = IntentStore::open_at(home.path()).expect("open");
        store.upsert(&subject(), &role("VIP")).expect("upsert");
        store.upsert(&subject(), &role("Old")).expect("upsert");
        store
            .replace_all(&subject(), BTreeSet::from([role("VIP"), role("Mod")]))
            .expect("replace");
    }

    let reopened = IntentStore::open(paths::intents_path(home.path())).expect("reopen");
    assert_eq!(
        reopened.list_roles(&subject()),
        BTreeSet::from([role("Mod"), role("VIP")])
    );
}

#[test]
fn wrong_shape_json_is_a_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".rolesync")
        .child("intents.json")
        .write_str("[\"this is a list\"]")
        .expect("write");

    let err = IntentStore::open_at(home.path()).unwrap_err();
    assert!(matches!(err, StoreError::Parse { .. }), "got: {err}");
}
