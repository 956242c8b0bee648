//! Notification feed for the signed-in user

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    decode_entries, latest_timestamp, path_segment, record_items, rows, Entry, ServiceContext,
};
use crate::error::{Error, Result, StorageError};
use crate::models::{Collection, Notification, Origin, Record, PUSH_EVENTS};
use crate::sync::{BatchReport, Outcome, SubscriptionHandle};
use crate::transport::{EventTransport, TransportSubscription};
use crate::util::key_text;

const COLLECTION: Collection = Collection::Notifications;

/// Push channel carrying notification records
pub const NOTIFICATIONS_CHANNEL: &str = "notifications";

#[derive(Debug, Clone)]
pub struct NotificationService {
    ctx: ServiceContext,
}

impl NotificationService {
    pub const fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Called for every accepted notification write of this user, tombstones
    /// included.
    pub fn subscribe(&self, callback: impl Fn(&Record) + Send + Sync + 'static) -> SubscriptionHandle {
        self.ctx
            .engine
            .subscribe_scope(COLLECTION, self.ctx.user_id.clone(), callback)
    }

    /// Live notifications, newest first
    pub fn list(&self) -> Result<Vec<Entry<Notification>>> {
        let mut entries: Vec<Entry<Notification>> = decode_entries(COLLECTION, self.own_records()?);
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    pub fn unread_count(&self) -> Result<usize> {
        Ok(self.list()?.iter().filter(|entry| !entry.item.read).count())
    }

    /// Mark one notification read locally, then on the server. A rejection
    /// restores the unread state.
    pub async fn mark_read(&self, id: &str) -> Result<()> {
        let record = self.own_record(id)?;
        let notification: Notification = record.decode().map_err(|error| {
            Error::InvalidInput(format!("notification {id} has an unreadable payload: {error}"))
        })?;
        if notification.read {
            return Ok(());
        }

        self.write_read_state(&record, true)?;
        let path = format!("/api/notifications/{}/read", path_segment(id));
        match self.ctx.client.post(&path, &json!({})).await {
            Ok(_) => Ok(()),
            Err(error) => {
                let error = Error::from(error);
                if !error.is_retryable() {
                    tracing::warn!(%id, %error, "Server refused mark-read; reverting");
                    self.write_read_state(&record, false)?;
                }
                Err(error)
            }
        }
    }

    /// Mark every unread notification read. Returns how many changed.
    pub async fn mark_all_read(&self) -> Result<usize> {
        let unread: Vec<Record> = self
            .own_records()?
            .into_iter()
            .filter(|record| {
                record
                    .decode::<Notification>()
                    .is_ok_and(|notification| !notification.read)
            })
            .collect();
        if unread.is_empty() {
            return Ok(0);
        }

        for record in &unread {
            self.write_read_state(record, true)?;
        }
        match self.ctx.client.post("/api/notifications/read-all", &json!({})).await {
            Ok(_) => Ok(unread.len()),
            Err(error) => {
                let error = Error::from(error);
                if !error.is_retryable() {
                    tracing::warn!(count = unread.len(), %error, "Server refused mark-all-read; reverting");
                    for record in &unread {
                        self.write_read_state(record, false)?;
                    }
                }
                Err(error)
            }
        }
    }

    /// Tombstone a notification locally and tell the server. The local
    /// dismissal stands even when the server call fails.
    pub async fn dismiss(&self, id: &str) -> Result<()> {
        self.own_record(id)?;
        self.ctx.engine.tombstone(COLLECTION, id, Origin::Local)?;
        let path = format!("/api/notifications/{}/dismiss", path_segment(id));
        self.ctx.client.post(&path, &json!({})).await?;
        Ok(())
    }

    /// Fetch `GET /api/notifications` and merge every row.
    pub async fn refresh(&self) -> Result<BatchReport> {
        let body = self.ctx.client.get("/api/notifications", &[]).await?;
        let raws: Vec<Value> = rows(&body, "notifications")
            .iter()
            .map(|row| listing_record(row, &self.ctx.user_id))
            .collect();
        let report = self.ctx.engine.ingest_batch(COLLECTION, &raws)?;
        tracing::debug!(
            accepted = report.accepted(),
            total = report.total(),
            "Refreshed notifications"
        );
        Ok(report)
    }

    /// Route the notification record channel and the legacy push events into
    /// the engine. Keep the returned subscriptions to stay bound.
    pub fn bind(&self, transport: &EventTransport) -> Vec<TransportSubscription> {
        let mut subscriptions = Vec::with_capacity(PUSH_EVENTS.len() + 1);

        let engine = Arc::clone(&self.ctx.engine);
        subscriptions.push(transport.subscribe(NOTIFICATIONS_CHANNEL, move |event| {
            if PUSH_EVENTS.contains(&event.event.as_str()) {
                return Ok(());
            }
            engine.ingest_batch(COLLECTION, record_items(&event.data))?;
            Ok(())
        }));

        for name in PUSH_EVENTS {
            let ctx = self.ctx.clone();
            subscriptions.push(transport.subscribe(name, move |event| {
                if let Some(notification) = Notification::from_push_event(&event.event, &event.data) {
                    store_pushed(&ctx, &notification)?;
                }
                Ok(())
            }));
        }
        subscriptions
    }

    fn own_records(&self) -> Result<Vec<Record>> {
        let user_id = self.ctx.user_id.as_str();
        Ok(self
            .ctx
            .engine
            .list_where(COLLECTION, |record| record.owner_scope == user_id)?)
    }

    fn own_record(&self, id: &str) -> Result<Record> {
        self.ctx
            .engine
            .get(COLLECTION, id)?
            .filter(|record| !record.tombstone && record.owner_scope == self.ctx.user_id)
            .ok_or_else(|| Error::NotFound(format!("notification {id}")))
    }

    fn write_read_state(&self, base: &Record, read: bool) -> Result<Outcome> {
        let mut payload = base.payload.clone();
        if let Some(object) = payload.as_object_mut() {
            object.insert("read".to_string(), Value::Bool(read));
        }
        let record = Record::local(base.id.clone(), base.owner_scope.clone(), payload, self.ctx.now());
        Ok(self.ctx.engine.reconcile(COLLECTION, record)?)
    }
}

fn store_pushed(
    ctx: &ServiceContext,
    notification: &Notification,
) -> std::result::Result<Outcome, StorageError> {
    let id = format!("push:{}", Uuid::now_v7());
    let record = Record::remote(id, ctx.user_id.clone(), Value::Null, ctx.now()).with_payload(notification)?;
    ctx.engine.reconcile(COLLECTION, record)
}

/// Wire record for one listing row. Rows already in record shape pass
/// through; the version of a plain row is its newest of `created_at` and
/// `read_at`.
fn listing_record(row: &Value, user_id: &str) -> Value {
    if row.get("payload").is_some() {
        return row.clone();
    }
    let stamp = latest_timestamp(row, &["updated_at", "created_at", "read_at"]);
    let payload = serde_json::to_value(Notification::from_listing(row)).unwrap_or(Value::Null);
    json!({
        "id": row.get("id").and_then(key_text),
        "owner_scope": user_id,
        "updated_at": stamp,
        "payload": payload,
    })
}
