mod common;

use std::sync::Arc;
use std::time::Duration;

use petsit_sync::store::CURRENT_VERSION;
use petsit_sync::{
    Clock, Collection, ManualClock, Origin, Outcome, ReconciliationEngine, Record, SqliteStore,
    SystemClock,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

fn open(dir: &TempDir, clock: Arc<dyn Clock>) -> ReconciliationEngine {
    let store = SqliteStore::open(dir.path().join("sync").join("petsit.db")).unwrap();
    ReconciliationEngine::new(Arc::new(store), clock)
}

#[test]
fn merge_decisions_survive_reopen() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::starting_at(1_000));

    {
        let engine = open(&dir, Arc::clone(&clock));
        let newer = Record::remote("n-1", "7", json!({"title": "v2"}), 200);
        let older = Record::remote("n-1", "7", json!({"title": "v1"}), 100);
        assert_eq!(engine.reconcile(Collection::Notifications, newer).unwrap(), Outcome::Inserted);
        assert_eq!(engine.reconcile(Collection::Notifications, older).unwrap(), Outcome::Stale);

        engine.reconcile(Collection::Messages, Record::remote("m-1", "7", json!({"text": "hi"}), 50)).unwrap();
        engine.tombstone(Collection::Messages, "m-1", Origin::Local).unwrap();
    }

    let engine = open(&dir, clock);
    let stored = engine.get(Collection::Notifications, "n-1").unwrap().unwrap();
    assert_eq!(stored.payload, json!({"title": "v2"}));

    // Tombstones stay terminal across restarts.
    let late = Record::remote("m-1", "7", json!({"text": "hi"}), 60);
    assert_eq!(
        engine.reconcile(Collection::Messages, late).unwrap(),
        Outcome::BlockedByTombstone
    );
    assert!(engine.list(Collection::Messages).unwrap().is_empty());
    assert!(CURRENT_VERSION >= 2);
}

#[test]
fn expired_tombstones_are_purged() {
    common::init_tracing();
    let dir = TempDir::new().unwrap();
    let engine = open(&dir, Arc::new(SystemClock::new()));

    let old = Record::remote("n-old", "7", json!({}), 10).to_tombstone(10, Origin::Remote);
    engine.reconcile(Collection::Notifications, old).unwrap();
    engine
        .reconcile(Collection::Notifications, Record::remote("n-live", "7", json!({}), 10))
        .unwrap();

    assert_eq!(engine.purge_tombstones(Duration::from_secs(60)).unwrap(), 1);
    assert!(engine.get(Collection::Notifications, "n-old").unwrap().is_none());
    assert!(engine.get(Collection::Notifications, "n-live").unwrap().is_some());
}
