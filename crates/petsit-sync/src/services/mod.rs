//! Domain services built on the reconciliation engine and the REST client.
//!
//! Services never write to the store directly: every local or server version
//! goes through [`ReconciliationEngine::reconcile`], so UI subscriptions see
//! optimistic writes, confirmations and reverts the same way.

mod location;
mod messaging;
mod notifications;

pub use location::{LocationService, NearbySitter, LOCATIONS_CHANNEL, PRESENCE_WINDOW};
pub use messaging::{MessagingService, CONVERSATIONS_CHANNEL, MESSAGES_CHANNEL, MESSAGE_SENT_EVENT};
pub use notifications::{NotificationService, NOTIFICATIONS_CHANNEL};

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::client::ApiClient;
use crate::clock::Clock;
use crate::models::{parse_timestamp, Collection, Record};
use crate::sync::ReconciliationEngine;

/// Collaborators shared by every service for one signed-in user
#[derive(Clone)]
pub struct ServiceContext {
    engine: Arc<ReconciliationEngine>,
    client: Arc<ApiClient>,
    clock: Arc<dyn Clock>,
    user_id: String,
}

impl ServiceContext {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        client: Arc<ApiClient>,
        clock: Arc<dyn Clock>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            engine,
            client,
            clock,
            user_id: user_id.into(),
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    pub fn client(&self) -> &Arc<ApiClient> {
        &self.client
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn now(&self) -> i64 {
        self.clock.now()
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// A decoded record payload with its identity and version
#[derive(Debug, Clone, PartialEq)]
pub struct Entry<T> {
    pub id: String,
    pub updated_at: i64,
    pub item: T,
}

fn decode_entries<T: DeserializeOwned>(collection: Collection, records: Vec<Record>) -> Vec<Entry<T>> {
    records
        .into_iter()
        .filter_map(|record| match record.decode::<T>() {
            Ok(item) => Some(Entry {
                id: record.id,
                updated_at: record.updated_at,
                item,
            }),
            Err(error) => {
                tracing::debug!(%collection, id = %record.id, %error, "Skipping undecodable payload");
                None
            }
        })
        .collect()
}

/// Newest timestamp among `keys`; each may be Unix ms or a date string
fn latest_timestamp(row: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|key| row.get(*key))
        .filter_map(|value| match value {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => parse_timestamp(text),
            _ => None,
        })
        .max()
}

fn rows<'a>(body: &'a Value, key: &str) -> &'a [Value] {
    body.get(key)
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

/// Percent-encode an id for use as one path segment
fn path_segment(id: &str) -> String {
    url::form_urlencoded::byte_serialize(id.as_bytes()).collect()
}

/// Push data holding one record or an array of records
fn record_items(data: &Value) -> &[Value] {
    match data {
        Value::Array(items) => items.as_slice(),
        single => std::slice::from_ref(single),
    }
}
