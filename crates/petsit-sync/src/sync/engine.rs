//! Reconciliation engine: the only writer to the local store

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use super::diagnostics::{Diagnostic, Diagnostics};
use super::merge::{decide, BatchReport, Outcome};
use super::subscription::{RecordCallback, RecordFilter, SubscriptionHandle, SubscriptionRegistry};
use crate::clock::Clock;
use crate::error::StorageError;
use crate::models::{Collection, Origin, Record};
use crate::store::LocalStore;
use crate::util::unix_millis_now;

/// Merges incoming records into the local store and fans accepted writes
/// out to subscriptions.
pub struct ReconciliationEngine {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    subscriptions: SubscriptionRegistry,
    diagnostics: Diagnostics,
    // Serializes read-decide-write; never held while callbacks run.
    write_lock: Mutex<()>,
}

impl ReconciliationEngine {
    pub fn new(store: Arc<dyn LocalStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            subscriptions: SubscriptionRegistry::new(),
            diagnostics: Diagnostics::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    /// Merge one record. Accepted writes are persisted and every matching
    /// subscription has been called before this returns.
    pub fn reconcile(&self, collection: Collection, incoming: Record) -> Result<Outcome, StorageError> {
        if incoming.origin == Origin::Remote {
            self.clock.observe(incoming.updated_at);
        }

        let outcome = {
            let _guard = self.write_lock.lock().map_err(|_| StorageError::Poisoned)?;
            let existing = self.store.get_entry(collection, &incoming.id)?;
            let outcome = decide(existing.as_ref(), &incoming, self.store.next_seq()?);
            if outcome.is_accepted() {
                self.store.put(collection, &incoming)?;
            }
            outcome
        };

        match &outcome {
            Outcome::Inserted | Outcome::Updated => {
                let delivered = self.subscriptions.notify(collection, &incoming);
                tracing::trace!(
                    %collection,
                    id = %incoming.id,
                    updated_at = incoming.updated_at,
                    %outcome,
                    delivered,
                    "Accepted record"
                );
            }
            _ => {
                tracing::debug!(
                    %collection,
                    id = %incoming.id,
                    updated_at = incoming.updated_at,
                    %outcome,
                    "Discarded record"
                );
            }
        }
        Ok(outcome)
    }

    /// Merge records in order. A storage failure stops the batch; records
    /// merged before it stay merged.
    pub fn reconcile_batch(
        &self,
        collection: Collection,
        records: impl IntoIterator<Item = Record>,
    ) -> Result<BatchReport, StorageError> {
        let mut report = BatchReport::default();
        for record in records {
            let outcome = self.reconcile(collection, record)?;
            report.record(&outcome);
        }
        Ok(report)
    }

    /// Validate and merge untrusted JSON. Malformed records are dropped with
    /// an `InvalidRecord` diagnostic instead of failing the caller.
    pub fn ingest(&self, collection: Collection, raw: &Value) -> Result<Outcome, StorageError> {
        match Record::from_untrusted(raw) {
            Ok(record) => self.reconcile(collection, record),
            Err(error) => {
                let reason = error.to_string();
                tracing::warn!(%collection, %reason, "Dropped invalid record");
                self.diagnostics.publish(Diagnostic::InvalidRecord {
                    collection,
                    reason: reason.clone(),
                });
                Ok(Outcome::Invalid(reason))
            }
        }
    }

    pub fn ingest_batch<'a>(
        &self,
        collection: Collection,
        raws: impl IntoIterator<Item = &'a Value>,
    ) -> Result<BatchReport, StorageError> {
        let mut report = BatchReport::default();
        for raw in raws {
            let outcome = self.ingest(collection, raw)?;
            report.record(&outcome);
        }
        Ok(report)
    }

    /// Tombstone a record with a fresh local timestamp.
    ///
    /// Returns `None` when no record with that id exists.
    pub fn tombstone(
        &self,
        collection: Collection,
        id: &str,
        origin: Origin,
    ) -> Result<Option<Outcome>, StorageError> {
        let Some(existing) = self.store.get(collection, id)? else {
            return Ok(None);
        };
        if existing.tombstone {
            return Ok(Some(Outcome::Duplicate));
        }
        let tombstone = existing.to_tombstone(self.clock.now(), origin);
        self.reconcile(collection, tombstone).map(Some)
    }

    pub fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, StorageError> {
        self.store.get(collection, id)
    }

    /// Live (non-tombstoned) records
    pub fn list(&self, collection: Collection) -> Result<Vec<Record>, StorageError> {
        self.store.get_all(collection, false)
    }

    /// Live records matching `filter`
    pub fn list_where(
        &self,
        collection: Collection,
        filter: impl Fn(&Record) -> bool,
    ) -> Result<Vec<Record>, StorageError> {
        Ok(self
            .list(collection)?
            .into_iter()
            .filter(|record| filter(record))
            .collect())
    }

    pub fn subscribe(
        &self,
        collection: Collection,
        filter: impl Fn(&Record) -> bool + Send + Sync + 'static,
        callback: impl Fn(&Record) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let filter: RecordFilter = Arc::new(filter);
        let callback: RecordCallback = Arc::new(callback);
        self.subscriptions.register(collection, filter, callback)
    }

    /// Subscribe to every record in `collection` owned by `owner_scope`
    pub fn subscribe_scope(
        &self,
        collection: Collection,
        owner_scope: impl Into<String>,
        callback: impl Fn(&Record) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        let owner_scope = owner_scope.into();
        self.subscribe(
            collection,
            move |record| record.owner_scope == owner_scope,
            callback,
        )
    }

    /// Physically remove tombstones older than `retention` in every collection
    pub fn purge_tombstones(&self, retention: Duration) -> Result<usize, StorageError> {
        let retention_ms = i64::try_from(retention.as_millis()).unwrap_or(i64::MAX);
        let cutoff = unix_millis_now().saturating_sub(retention_ms);
        let _guard = self.write_lock.lock().map_err(|_| StorageError::Poisoned)?;
        let mut removed = 0;
        for collection in Collection::ALL {
            removed += self.store.purge_tombstones(collection, cutoff)?;
        }
        if removed > 0 {
            tracing::info!(removed, cutoff, "Purged tombstones");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{SqliteStore, StoredRecord};

    fn setup() -> ReconciliationEngine {
        ReconciliationEngine::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(ManualClock::starting_at(1_000)),
        )
    }

    fn counter(engine: &ReconciliationEngine, collection: Collection) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        engine.subscribe(collection, |_| true, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[test]
    fn stale_write_is_discarded() {
        let engine = setup();
        let notified = counter(&engine, Collection::Notifications);

        let newer = Record::remote("n-1", "7", json!({"v": "A"}), 100);
        let older = Record::remote("n-1", "7", json!({"v": "B"}), 90);
        assert_eq!(
            engine.reconcile(Collection::Notifications, newer).unwrap(),
            Outcome::Inserted
        );
        assert_eq!(
            engine.reconcile(Collection::Notifications, older).unwrap(),
            Outcome::Stale
        );

        let stored = engine.get(Collection::Notifications, "n-1").unwrap().unwrap();
        assert_eq!(stored.payload, json!({"v": "A"}));
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tombstone_blocks_late_older_write() {
        let engine = setup();
        let notified = counter(&engine, Collection::Notifications);
        let tombstone = Record::remote("n-1", "7", Value::Null, 110).to_tombstone(110, Origin::Remote);
        engine.reconcile(Collection::Notifications, tombstone).unwrap();

        let late = Record::remote("n-1", "7", json!({"v": "A"}), 105);
        assert_eq!(
            engine.reconcile(Collection::Notifications, late).unwrap(),
            Outcome::BlockedByTombstone
        );
        assert!(engine.list(Collection::Notifications).unwrap().is_empty());
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reconcile_is_idempotent() {
        let engine = setup();
        let notified = counter(&engine, Collection::Messages);
        let record = Record::remote("m-1", "7", json!({"text": "hello"}), 10);

        engine.reconcile(Collection::Messages, record.clone()).unwrap();
        let before = engine.get(Collection::Messages, "m-1").unwrap();
        assert_eq!(
            engine.reconcile(Collection::Messages, record).unwrap(),
            Outcome::Duplicate
        );
        assert_eq!(engine.get(Collection::Messages, "m-1").unwrap(), before);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stored_timestamp_never_decreases() {
        let engine = setup();
        let timestamps = [50, 10, 70, 70, 65, 90, 20];
        let mut previous = i64::MIN;
        for (index, updated_at) in timestamps.into_iter().enumerate() {
            let record = Record::remote("n-1", "7", json!({"i": index}), updated_at);
            engine.reconcile(Collection::Notifications, record).unwrap();
            let stored = engine.get(Collection::Notifications, "n-1").unwrap().unwrap();
            assert!(stored.updated_at >= previous);
            previous = stored.updated_at;
        }
        assert_eq!(previous, 90);
    }

    #[test]
    fn resurrect_replaces_tombstone_only_when_newer() {
        let engine = setup();
        let tombstone = Record::remote("n-1", "7", Value::Null, 110).to_tombstone(110, Origin::Remote);
        engine.reconcile(Collection::Notifications, tombstone).unwrap();

        let mut undo = Record::remote("n-1", "7", json!({"v": "restored"}), 111);
        undo.resurrect = true;
        assert_eq!(
            engine.reconcile(Collection::Notifications, undo).unwrap(),
            Outcome::Updated
        );
        assert_eq!(engine.list(Collection::Notifications).unwrap().len(), 1);
    }

    #[test]
    fn subscription_filter_limits_delivery() {
        let engine = setup();
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        engine.subscribe_scope(Collection::Notifications, "7", move |record| {
            sink.lock().unwrap().push(record.id.clone());
        });

        engine
            .reconcile(Collection::Notifications, Record::remote("a", "7", json!({}), 1))
            .unwrap();
        engine
            .reconcile(Collection::Notifications, Record::remote("b", "8", json!({}), 1))
            .unwrap();
        assert_eq!(*delivered.lock().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn unsubscribed_callback_is_never_called() {
        let engine = setup();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handle = engine.subscribe(Collection::Messages, |_| true, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        handle.unsubscribe();

        engine
            .reconcile(Collection::Messages, Record::remote("m-1", "7", json!({}), 1))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callback_may_read_the_engine() {
        let engine = Arc::new(setup());
        let observed = Arc::new(Mutex::new(None));
        let weak = Arc::downgrade(&engine);
        let sink = Arc::clone(&observed);
        engine.subscribe(Collection::Notifications, |_| true, move |record| {
            if let Some(engine) = weak.upgrade() {
                *sink.lock().unwrap() = engine.get(Collection::Notifications, &record.id).unwrap();
            }
        });

        let record = Record::remote("n-1", "7", json!({"v": 1}), 5);
        engine.reconcile(Collection::Notifications, record.clone()).unwrap();
        assert_eq!(*observed.lock().unwrap(), Some(record));
    }

    #[test]
    fn ingest_drops_invalid_records_with_diagnostic() {
        let engine = setup();
        let mut diagnostics = engine.subscribe_diagnostics();

        let report = engine
            .ingest_batch(
                Collection::Notifications,
                &[
                    json!({"id": 1, "owner_scope": 7, "payload": {}, "updated_at": 5}),
                    json!({"id": 2, "payload": {}, "updated_at": 5}),
                    json!("garbage"),
                ],
            )
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.invalid, 2);
        assert!(matches!(
            diagnostics.try_recv().unwrap(),
            Diagnostic::InvalidRecord { collection: Collection::Notifications, .. }
        ));
    }

    #[test]
    fn remote_records_advance_the_clock() {
        let clock = ManualClock::starting_at(1_000);
        let engine = ReconciliationEngine::new(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(clock.clone()),
        );
        engine
            .reconcile(Collection::Notifications, Record::remote("n-1", "7", json!({}), 50_000))
            .unwrap();
        assert!(engine.clock().now() > 50_000);
        assert!(clock.current() > 50_000);
    }

    #[test]
    fn tombstone_uses_fresh_timestamp() {
        let engine = setup();
        engine
            .reconcile(Collection::Notifications, Record::remote("n-1", "7", json!({}), 500))
            .unwrap();
        assert!(matches!(
            engine.tombstone(Collection::Notifications, "n-1", Origin::Local).unwrap(),
            Some(Outcome::Updated)
        ));
        assert_eq!(
            engine.tombstone(Collection::Notifications, "missing", Origin::Local).unwrap(),
            None
        );
        let stored = engine.get(Collection::Notifications, "n-1").unwrap().unwrap();
        assert!(stored.tombstone);
        assert!(stored.updated_at > 500);
    }

    struct FailingStore {
        inner: SqliteStore,
        fail_on_put: usize,
        puts: AtomicUsize,
    }

    impl LocalStore for FailingStore {
        fn get_entry(
            &self,
            collection: Collection,
            id: &str,
        ) -> Result<Option<StoredRecord>, StorageError> {
            self.inner.get_entry(collection, id)
        }

        fn get_all(
            &self,
            collection: Collection,
            include_tombstones: bool,
        ) -> Result<Vec<Record>, StorageError> {
            self.inner.get_all(collection, include_tombstones)
        }

        fn put(&self, collection: Collection, record: &Record) -> Result<u64, StorageError> {
            if self.puts.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on_put {
                return Err(StorageError::Io(std::io::Error::other("disk full")));
            }
            self.inner.put(collection, record)
        }

        fn next_seq(&self) -> Result<u64, StorageError> {
            self.inner.next_seq()
        }

        fn purge_tombstones(
            &self,
            collection: Collection,
            older_than: i64,
        ) -> Result<usize, StorageError> {
            self.inner.purge_tombstones(collection, older_than)
        }
    }

    #[test]
    fn storage_failure_stops_batch_without_rollback() {
        let engine = ReconciliationEngine::new(
            Arc::new(FailingStore {
                inner: SqliteStore::open_in_memory().unwrap(),
                fail_on_put: 3,
                puts: AtomicUsize::new(0),
            }),
            Arc::new(ManualClock::starting_at(0)),
        );
        let records = (1..=5).map(|i| Record::remote(format!("n-{i}"), "7", json!({}), i));

        let result = engine.reconcile_batch(Collection::Notifications, records);
        assert!(matches!(result, Err(StorageError::Io(_))));
        assert_eq!(engine.list(Collection::Notifications).unwrap().len(), 2);
        assert!(engine.get(Collection::Notifications, "n-4").unwrap().is_none());
    }
}
