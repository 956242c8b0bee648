//! In-memory subscription registry

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::models::{Collection, Record};

pub type RecordFilter = Arc<dyn Fn(&Record) -> bool + Send + Sync>;
pub type RecordCallback = Arc<dyn Fn(&Record) + Send + Sync>;

struct Entry {
    collection: Collection,
    filter: RecordFilter,
    callback: RecordCallback,
    live: Arc<AtomicBool>,
}

type Entries = Mutex<BTreeMap<u64, Entry>>;

/// Subscriptions keyed by registration order
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    entries: Arc<Entries>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        collection: Collection,
        filter: RecordFilter,
        callback: RecordCallback,
    ) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let live = Arc::new(AtomicBool::new(true));
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                id,
                Entry {
                    collection,
                    filter,
                    callback,
                    live: Arc::clone(&live),
                },
            );
        } else {
            tracing::warn!(%collection, "Subscription registry poisoned; subscription inactive");
            live.store(false, Ordering::Release);
        }
        SubscriptionHandle {
            id,
            live,
            entries: Arc::downgrade(&self.entries),
        }
    }

    /// Invoke every live, matching subscription on `collection` in
    /// registration order. The registry lock is not held while callbacks run.
    pub fn notify(&self, collection: Collection, record: &Record) -> usize {
        let targets: Vec<_> = match self.entries.lock() {
            Ok(entries) => entries
                .values()
                .filter(|entry| entry.collection == collection)
                .map(|entry| {
                    (
                        Arc::clone(&entry.live),
                        Arc::clone(&entry.filter),
                        Arc::clone(&entry.callback),
                    )
                })
                .collect(),
            Err(_) => return 0,
        };

        let mut delivered = 0;
        for (live, filter, callback) in targets {
            if live.load(Ordering::Acquire) && filter(record) {
                callback(record);
                delivered += 1;
            }
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`.
///
/// Dropping the handle leaves the subscription registered; call
/// [`SubscriptionHandle::unsubscribe`] to stop delivery.
pub struct SubscriptionHandle {
    id: u64,
    live: Arc<AtomicBool>,
    entries: Weak<Entries>,
}

impl SubscriptionHandle {
    /// Stop delivery immediately, including for a fan-out already in progress.
    pub fn unsubscribe(&self) {
        self.live.store(false, Ordering::Release);
        if let Some(entries) = self.entries.upgrade() {
            if let Ok(mut entries) = entries.lock() {
                entries.remove(&self.id);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
