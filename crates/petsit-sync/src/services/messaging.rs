//! Direct messages and conversation summaries

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use super::{
    decode_entries, latest_timestamp, path_segment, record_items, rows, Entry, ServiceContext,
};
use crate::error::{Error, Result, StorageError};
use crate::models::{
    conversation_id, message_record_id, Collection, Conversation, Message, MessageKind, Origin, Record,
};
use crate::sync::{BatchReport, Outcome, SubscriptionHandle};
use crate::transport::{EventTransport, TransportSubscription};
use crate::util::key_text;

const MESSAGES: Collection = Collection::Messages;
const CONVERSATIONS: Collection = Collection::Conversations;

/// Push event announcing a new message
pub const MESSAGE_SENT_EVENT: &str = "message.sent";
/// Push channel carrying message records
pub const MESSAGES_CHANNEL: &str = "messages";
/// Push channel carrying conversation records
pub const CONVERSATIONS_CHANNEL: &str = "conversations";

/// How far a server row's `created_at` may be from a pending message's local
/// send time and still be taken as its echo
const PENDING_MATCH_WINDOW_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone)]
pub struct MessagingService {
    ctx: ServiceContext,
}

impl MessagingService {
    pub const fn new(ctx: ServiceContext) -> Self {
        Self { ctx }
    }

    /// Called for every accepted message write of this user, optimistic
    /// sends and tombstones included.
    pub fn subscribe(&self, callback: impl Fn(&Record) + Send + Sync + 'static) -> SubscriptionHandle {
        self.ctx
            .engine
            .subscribe_scope(MESSAGES, self.ctx.user_id.clone(), callback)
    }

    /// Called for every accepted conversation summary write of this user
    pub fn subscribe_conversations(
        &self,
        callback: impl Fn(&Record) + Send + Sync + 'static,
    ) -> SubscriptionHandle {
        self.ctx
            .engine
            .subscribe_scope(CONVERSATIONS, self.ctx.user_id.clone(), callback)
    }

    /// Send a text message.
    ///
    /// The message is stored as pending right away. The server's
    /// confirmation replaces it under the same record id. A rejection
    /// tombstones it; a network failure leaves it pending until a server
    /// row for it arrives by push or refresh.
    pub async fn send(&self, receiver_id: &str, text: &str) -> Result<Message> {
        let receiver_id = receiver_id.trim();
        let text = text.trim();
        if receiver_id.is_empty() || receiver_id == self.ctx.user_id {
            return Err(Error::InvalidInput(format!("invalid receiver '{receiver_id}'")));
        }
        if text.is_empty() {
            return Err(Error::InvalidInput("message text is empty".to_string()));
        }

        let user_id = self.ctx.user_id.clone();
        let client_id = Uuid::now_v7().to_string();
        let sent_at = self.ctx.now();
        let optimistic = Message {
            sender_id: user_id.clone(),
            receiver_id: receiver_id.to_string(),
            conversation_id: Some(conversation_id(&user_id, receiver_id)),
            text: text.to_string(),
            kind: MessageKind::Text,
            client_generated_id: Some(client_id.clone()),
            server_id: None,
            sent_at: Some(sent_at),
            read: false,
            pending: true,
        };
        let record_id = message_record_id(&user_id, receiver_id, &client_id);
        self.ctx.engine.reconcile(
            MESSAGES,
            Record::local(record_id.clone(), user_id.clone(), Value::Null, sent_at)
                .with_payload(&optimistic)
                .map_err(StorageError::from)?,
        )?;
        self.touch_conversation(receiver_id, text, sent_at, false)?;

        let body = json!({
            "receiver_id": wire_id(receiver_id),
            "message": text,
            "type": MessageKind::Text.as_str(),
            "client_generated_id": client_id,
        });
        let response = match self.ctx.client.post("/api/messages/send", &body).await {
            Ok(response) => response,
            Err(error) => {
                let error = Error::from(error);
                if error.is_retryable() {
                    tracing::warn!(id = %record_id, %error, "Message left pending");
                } else {
                    tracing::warn!(id = %record_id, %error, "Message rejected; reverting");
                    self.ctx.engine.tombstone(MESSAGES, &record_id, Origin::Local)?;
                }
                return Err(error);
            }
        };

        let confirmed = confirm(&optimistic, response.get("message").unwrap_or(&Value::Null));
        // The confirmation must supersede the optimistic write even when the
        // server clock is behind ours.
        let stamp = confirmed.sent_at.unwrap_or(sent_at).max(sent_at + 1);
        let outcome = self.ctx.engine.reconcile(
            MESSAGES,
            Record::remote(record_id.clone(), user_id, Value::Null, stamp)
                .with_payload(&confirmed)
                .map_err(StorageError::from)?,
        )?;
        tracing::debug!(id = %record_id, %outcome, "Message confirmed");
        Ok(confirmed)
    }

    /// Messages exchanged between `a` and `b`, oldest first
    pub fn messages_between(&self, a: &str, b: &str) -> Result<Vec<Entry<Message>>> {
        let mut entries: Vec<Entry<Message>> = decode_entries(MESSAGES, self.ctx.engine.list(MESSAGES)?);
        entries.retain(|entry| {
            let message = &entry.item;
            (message.sender_id == a && message.receiver_id == b)
                || (message.sender_id == b && message.receiver_id == a)
        });
        entries.sort_by(|x, y| {
            sort_key(x)
                .cmp(&sort_key(y))
                .then_with(|| x.id.cmp(&y.id))
        });
        Ok(entries)
    }

    /// Conversations of this user, most recent activity first
    pub fn conversations(&self) -> Result<Vec<Entry<Conversation>>> {
        let user_id = self.ctx.user_id.as_str();
        let records = self
            .ctx
            .engine
            .list_where(CONVERSATIONS, |record| record.owner_scope == user_id)?;
        let mut entries: Vec<Entry<Conversation>> = decode_entries(CONVERSATIONS, records);
        entries.sort_by(|x, y| {
            y.item
                .last_message_at
                .cmp(&x.item.last_message_at)
                .then_with(|| x.id.cmp(&y.id))
        });
        Ok(entries)
    }

    /// Received messages not yet read
    pub fn unread_count(&self) -> Result<usize> {
        let user_id = self.ctx.user_id.as_str();
        Ok(decode_entries::<Message>(MESSAGES, self.ctx.engine.list(MESSAGES)?)
            .iter()
            .filter(|entry| entry.item.receiver_id == user_id && !entry.item.read)
            .count())
    }

    /// Fetch `GET /api/messages/conversations` and merge every row.
    pub async fn refresh_conversations(&self) -> Result<BatchReport> {
        let body = self.ctx.client.get("/api/messages/conversations", &[]).await?;
        let raws: Vec<Value> = rows(&body, "conversations")
            .iter()
            .map(|row| conversation_wire(row, &self.ctx.user_id))
            .collect();
        Ok(self.ctx.engine.ingest_batch(CONVERSATIONS, &raws)?)
    }

    /// Fetch the messages of one conversation and merge them.
    pub async fn refresh_messages(&self, conversation_id: &str) -> Result<BatchReport> {
        let path = format!("/api/messages/conversations/{}", path_segment(conversation_id));
        let body = self.ctx.client.get(&path, &[]).await?;
        let mut known = self.known_messages()?;
        let raws: Vec<Value> = rows(&body, "messages")
            .iter()
            .map(|row| message_wire(row, &self.ctx.user_id, &mut known))
            .collect();
        let report = self.ctx.engine.ingest_batch(MESSAGES, &raws)?;
        tracing::debug!(
            %conversation_id,
            accepted = report.accepted(),
            total = report.total(),
            "Refreshed messages"
        );
        Ok(report)
    }

    /// Mark every received message of a conversation read, locally first.
    /// Returns how many messages changed.
    pub async fn mark_conversation_read(&self, conversation: &str) -> Result<usize> {
        let user_id = self.ctx.user_id.as_str();
        let unread: Vec<Entry<Message>> = decode_entries::<Message>(MESSAGES, self.ctx.engine.list(MESSAGES)?)
            .into_iter()
            .filter(|entry| {
                let message = &entry.item;
                message.receiver_id == user_id
                    && !message.read
                    && message
                        .conversation_id
                        .clone()
                        .unwrap_or_else(|| conversation_id(&message.sender_id, &message.receiver_id))
                        == conversation
            })
            .collect();

        for entry in &unread {
            let message = Message {
                read: true,
                ..entry.item.clone()
            };
            self.write(MESSAGES, &entry.id, &message)?;
        }
        if let Some(mut summary) = self.conversation(conversation)? {
            if summary.unread_count > 0 {
                summary.unread_count = 0;
                self.write(CONVERSATIONS, conversation, &summary)?;
            }
        }

        let path = format!("/api/messages/conversations/{}/read", path_segment(conversation));
        self.ctx.client.post(&path, &json!({})).await?;
        Ok(unread.len())
    }

    /// Route `message.sent` frames and the message and conversation record
    /// channels into the engine. Keep the returned subscriptions to stay bound.
    pub fn bind(&self, transport: &EventTransport) -> Vec<TransportSubscription> {
        let service = self.clone();
        let sent = transport.subscribe(MESSAGE_SENT_EVENT, move |event| {
            let row = event.data.get("message").unwrap_or(&event.data);
            service.receive(row)?;
            Ok(())
        });

        let engine = Arc::clone(&self.ctx.engine);
        let messages = transport.subscribe(MESSAGES_CHANNEL, move |event| {
            if event.event != MESSAGE_SENT_EVENT {
                engine.ingest_batch(MESSAGES, record_items(&event.data))?;
            }
            Ok(())
        });

        let engine = Arc::clone(&self.ctx.engine);
        let conversations = transport.subscribe(CONVERSATIONS_CHANNEL, move |event| {
            engine.ingest_batch(CONVERSATIONS, record_items(&event.data))?;
            Ok(())
        });

        vec![sent, messages, conversations]
    }

    /// Merge one server message row and keep its conversation current.
    fn receive(&self, row: &Value) -> StoreResult<Outcome> {
        let raw = message_wire(row, &self.ctx.user_id, &mut self.known_messages()?);
        let outcome = self.ctx.engine.ingest(MESSAGES, &raw)?;
        if outcome != Outcome::Inserted {
            return Ok(outcome);
        }

        let id = raw.get("id").and_then(Value::as_str).unwrap_or_default();
        if let Some(record) = self.ctx.engine.get(MESSAGES, id)? {
            if let Ok(message) = record.decode::<Message>() {
                let at = message.sent_at.unwrap_or(record.updated_at);
                if message.receiver_id == self.ctx.user_id {
                    self.touch_conversation(&message.sender_id, &message.text, at, true)?;
                } else if message.sender_id == self.ctx.user_id {
                    self.touch_conversation(&message.receiver_id, &message.text, at, false)?;
                }
            }
        }
        Ok(outcome)
    }

    fn conversation(&self, id: &str) -> StoreResult<Option<Conversation>> {
        Ok(self
            .ctx
            .engine
            .get(CONVERSATIONS, id)?
            .filter(|record| !record.tombstone)
            .and_then(|record| record.decode().ok()))
    }

    /// Record the latest message of the conversation with `other_id`.
    fn touch_conversation(&self, other_id: &str, text: &str, at: i64, incoming: bool) -> StoreResult<()> {
        let id = conversation_id(&self.ctx.user_id, other_id);
        let existing = self.conversation(&id)?;
        let newer = existing
            .as_ref()
            .and_then(|conversation| conversation.last_message_at)
            .is_none_or(|last| at >= last);

        let mut summary = existing.unwrap_or_else(|| Conversation {
            participant_ids: vec![self.ctx.user_id.clone(), other_id.to_string()],
            other_user_name: None,
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        });
        if newer {
            summary.last_message = Some(text.to_string());
            summary.last_message_at = Some(at);
        }
        if incoming {
            summary.unread_count = summary.unread_count.saturating_add(1);
        }
        self.write(CONVERSATIONS, &id, &summary)?;
        Ok(())
    }

    fn write<T: serde::Serialize>(&self, collection: Collection, id: &str, payload: &T) -> StoreResult<Outcome> {
        let record = Record::local(id, self.ctx.user_id.clone(), Value::Null, self.ctx.now()).with_payload(payload)?;
        self.ctx.engine.reconcile(collection, record)
    }

    /// Stored messages that a server row may stand for
    fn known_messages(&self) -> StoreResult<KnownMessages> {
        let mut known = KnownMessages::default();
        for entry in decode_entries::<Message>(MESSAGES, self.ctx.engine.list(MESSAGES)?) {
            let message = entry.item;
            match message.server_id {
                Some(server_id) => {
                    known.by_server_id.insert(server_id, entry.id);
                }
                None if message.pending && message.sender_id == self.ctx.user_id => {
                    known.pending.push(PendingMessage {
                        sent_at: message.sent_at.unwrap_or(entry.updated_at),
                        updated_at: entry.updated_at,
                        record_id: entry.id,
                        client_id: message.client_generated_id,
                        receiver_id: message.receiver_id,
                        text: message.text,
                    });
                }
                None => {}
            }
        }
        Ok(known)
    }
}

type StoreResult<T> = std::result::Result<T, StorageError>;

/// Record ids of stored messages, by server id, plus our own messages the
/// server has not acknowledged yet
#[derive(Debug, Default)]
struct KnownMessages {
    by_server_id: HashMap<String, String>,
    pending: Vec<PendingMessage>,
}

#[derive(Debug)]
struct PendingMessage {
    record_id: String,
    client_id: Option<String>,
    receiver_id: String,
    text: String,
    sent_at: i64,
    updated_at: i64,
}

impl KnownMessages {
    /// Take the pending message to `receiver_id` with the same text sent
    /// closest to `created_at`, within [`PENDING_MATCH_WINDOW_MS`].
    fn claim_pending(&mut self, receiver_id: &str, text: &str, created_at: i64) -> Option<PendingMessage> {
        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, pending)| {
                pending.receiver_id == receiver_id
                    && pending.text == text
                    && pending.sent_at.abs_diff(created_at) <= PENDING_MATCH_WINDOW_MS
            })
            .min_by_key(|(_, pending)| pending.sent_at.abs_diff(created_at))
            .map(|(index, _)| index)?;
        Some(self.pending.swap_remove(index))
    }
}

fn sort_key(entry: &Entry<Message>) -> i64 {
    entry.item.sent_at.unwrap_or(entry.updated_at)
}

/// Integer ids go over the wire as numbers
fn wire_id(id: &str) -> Value {
    id.parse::<i64>().map_or_else(|_| json!(id), |number| json!(number))
}

/// The optimistic message as confirmed by a `POST /api/messages/send` reply
fn confirm(optimistic: &Message, reply: &Value) -> Message {
    let text = |key: &str| reply.get(key).and_then(Value::as_str).map(ToString::to_string);
    Message {
        conversation_id: reply
            .get("conversation_id")
            .and_then(key_text)
            .or_else(|| optimistic.conversation_id.clone()),
        text: text("message").unwrap_or_else(|| optimistic.text.clone()),
        kind: text("type").map_or(optimistic.kind, |kind| MessageKind::from_wire(&kind)),
        server_id: reply.get("id").and_then(key_text),
        sent_at: latest_timestamp(reply, &["created_at"]).or(optimistic.sent_at),
        read: reply.get("is_read").and_then(Value::as_bool).unwrap_or(false),
        pending: false,
        ..optimistic.clone()
    }
}

/// Wire record for one server message row
/// (`{id, conversation_id, sender_id, receiver_id, message, is_read, type, created_at}`).
///
/// Rows carrying a client correlation id, or whose server id is already
/// stored, map onto the existing record id. A row of ours without either
/// claims the matching pending message instead of becoming a second copy.
fn message_wire(row: &Value, user_id: &str, known: &mut KnownMessages) -> Value {
    let server_id = row.get("id").and_then(key_text);
    let sender_id = row.get("sender_id").and_then(key_text);
    let receiver_id = row.get("receiver_id").and_then(key_text);
    let mut client_id = row.get("client_generated_id").and_then(key_text);
    let text = row
        .get("message")
        .or_else(|| row.get("text"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let sent_at = latest_timestamp(row, &["created_at"]);
    let mut updated_at = latest_timestamp(row, &["updated_at", "created_at", "read_at"]);

    let correlated = match (&client_id, &sender_id, &receiver_id) {
        (Some(client), Some(sender), Some(receiver)) => Some(message_record_id(sender, receiver, client)),
        _ => None,
    };
    let record_id = if correlated.is_some() {
        correlated
    } else if let Some(id) = &server_id {
        let claimed = match (&sender_id, &receiver_id, sent_at) {
            (Some(sender), Some(receiver), Some(created_at))
                if sender == user_id && !known.by_server_id.contains_key(id) =>
            {
                known.claim_pending(receiver, &text, created_at)
            }
            _ => None,
        };
        Some(match claimed {
            Some(pending) => {
                // Must supersede the optimistic write even when the server
                // clock is behind ours.
                updated_at = updated_at.map(|at| at.max(pending.updated_at + 1));
                client_id = pending.client_id;
                known.by_server_id.insert(id.clone(), pending.record_id.clone());
                pending.record_id
            }
            None => known
                .by_server_id
                .get(id)
                .cloned()
                .unwrap_or_else(|| format!("srv:{id}")),
        })
    } else {
        None
    };

    let payload = match (sender_id, receiver_id) {
        (Some(sender_id), Some(receiver_id)) => {
            let message = Message {
                conversation_id: Some(
                    row.get("conversation_id")
                        .and_then(key_text)
                        .unwrap_or_else(|| conversation_id(&sender_id, &receiver_id)),
                ),
                text,
                kind: row
                    .get("type")
                    .and_then(Value::as_str)
                    .map_or(MessageKind::Text, MessageKind::from_wire),
                client_generated_id: client_id,
                server_id,
                sent_at,
                read: row.get("is_read").and_then(Value::as_bool).unwrap_or(false),
                pending: false,
                sender_id,
                receiver_id,
            };
            serde_json::to_value(message).unwrap_or(Value::Null)
        }
        _ => Value::Null,
    };

    json!({
        "id": record_id,
        "owner_scope": user_id,
        "updated_at": updated_at,
        "payload": payload,
    })
}

/// Wire record for one `GET /api/messages/conversations` row
/// (`{conversation_id, other_user: {id, name}, last_message: {message, created_at}, unread_count}`).
fn conversation_wire(row: &Value, user_id: &str) -> Value {
    let other = row.get("other_user").unwrap_or(&Value::Null);
    let other_id = other.get("id").and_then(key_text);
    let id = row
        .get("conversation_id")
        .and_then(key_text)
        .or_else(|| other_id.as_deref().map(|other_id| conversation_id(user_id, other_id)));

    let last = row.get("last_message").unwrap_or(&Value::Null);
    let last_message_at = latest_timestamp(last, &["created_at"]);
    let payload = match other_id {
        Some(other_id) => {
            let conversation = Conversation {
                participant_ids: vec![user_id.to_string(), other_id],
                other_user_name: other.get("name").and_then(Value::as_str).map(ToString::to_string),
                last_message: last.get("message").and_then(Value::as_str).map(ToString::to_string),
                last_message_at,
                unread_count: row
                    .get("unread_count")
                    .and_then(Value::as_u64)
                    .and_then(|count| u32::try_from(count).ok())
                    .unwrap_or(0),
            };
            serde_json::to_value(conversation).unwrap_or(Value::Null)
        }
        None => Value::Null,
    };

    json!({
        "id": id,
        "owner_scope": user_id,
        "updated_at": latest_timestamp(row, &["updated_at"]).or(last_message_at).unwrap_or(0),
        "payload": payload,
    })
}
