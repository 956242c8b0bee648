//! Drops duplicate and stale record events before they reach handlers

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use super::frame::ChannelEvent;
use crate::models::parse_timestamp;

/// Versions tracked before the oldest half is forgotten
pub const DEFAULT_CAPACITY: usize = 4096;

type Key = (String, String);

/// Newest `updated_at` seen per `(channel, record id)`, bounded to a fixed
/// number of entries. Forgetting a version only lets a redelivery through to
/// the handlers again.
#[derive(Debug)]
pub struct Deduper {
    seen: Mutex<HashMap<Key, i64>>,
    capacity: usize,
}

/// Versions recorded by one [`Deduper::admit`] call
#[derive(Debug, Default)]
#[must_use = "release the marks when the event was not handled"]
pub struct Marks(Vec<Mark>);

#[derive(Debug)]
struct Mark {
    key: Key,
    previous: Option<i64>,
    updated_at: i64,
}

impl Default for Deduper {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl Deduper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn seen(&self) -> MutexGuard<'_, HashMap<Key, i64>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Filter `event` down to records newer than anything seen on its channel.
    ///
    /// Events whose data is not record-shaped pass through untouched.
    /// Returns `None` when nothing new remains. The returned [`Marks`] undo
    /// the recorded versions via [`release`](Self::release).
    pub fn admit(&self, event: ChannelEvent) -> Option<(ChannelEvent, Marks)> {
        let mut seen = self.seen();
        let mut marks = Vec::new();
        let mut fresh = |item: &Value| -> bool {
            let Some((id, updated_at)) = version_of(item) else {
                return true;
            };
            let key = (event.channel.clone(), id);
            let previous = seen.get(&key).copied();
            if previous.is_some_and(|previous| previous >= updated_at) {
                return false;
            }
            seen.insert(key.clone(), updated_at);
            marks.push(Mark {
                key,
                previous,
                updated_at,
            });
            true
        };

        let admitted = match &event.data {
            Value::Array(items) => {
                let kept: Vec<Value> = items.iter().filter(|item| fresh(*item)).cloned().collect();
                if kept.is_empty() && !items.is_empty() {
                    None
                } else {
                    let ChannelEvent { channel, event: name, .. } = event;
                    Some(ChannelEvent::new(channel, name, Value::Array(kept)))
                }
            }
            data => fresh(data).then_some(event),
        };
        if seen.len() > self.capacity {
            forget_oldest(&mut seen, self.capacity / 2);
        }
        admitted.map(|event| (event, Marks(marks)))
    }

    /// Undo the versions recorded by an `admit` whose event was not stored,
    /// so a redelivery of the same versions is admitted again. Versions
    /// superseded since then are left alone.
    pub fn release(&self, marks: Marks) {
        let mut seen = self.seen();
        for mark in marks.0.into_iter().rev() {
            if seen.get(&mark.key) != Some(&mark.updated_at) {
                continue;
            }
            match mark.previous {
                Some(previous) => {
                    seen.insert(mark.key, previous);
                }
                None => {
                    seen.remove(&mark.key);
                }
            }
        }
    }

    /// Number of tracked versions
    pub fn len(&self) -> usize {
        self.seen().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen().is_empty()
    }

    pub fn clear(&self) {
        self.seen().clear();
    }
}

/// Keep the `keep` entries with the newest versions.
fn forget_oldest(seen: &mut HashMap<Key, i64>, keep: usize) {
    let excess = seen.len().saturating_sub(keep);
    let mut oldest: Vec<(i64, Key)> = seen
        .iter()
        .map(|(key, updated_at)| (*updated_at, key.clone()))
        .collect();
    oldest.sort_unstable();
    for (_, key) in oldest.into_iter().take(excess) {
        seen.remove(&key);
    }
    tracing::debug!(forgotten = excess, kept = seen.len(), "Trimmed push dedupe versions");
}

fn version_of(item: &Value) -> Option<(String, i64)> {
    let id = match item.get("id")? {
        Value::String(id) => id.clone(),
        Value::Number(id) => id.to_string(),
        _ => return None,
    };
    let updated_at = match item.get("updated_at").or_else(|| item.get("updatedAt"))? {
        Value::Number(millis) => millis.as_i64()?,
        Value::String(text) => parse_timestamp(text)?,
        _ => return None,
    };
    Some((id, updated_at))
}
