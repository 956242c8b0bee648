//! Push wire codec
//!
//! Inbound frames are JSON objects `{event, data, channel?}`. `data` may be a
//! JSON document encoded as a string, which is decoded in place.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One event delivered on a named channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Stream the event arrived on; the event name when the frame names none
    pub channel: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ChannelEvent {
    pub fn new(channel: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self {
            channel: channel.into(),
            event: event.into(),
            data,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    data: Value,
}

/// Decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(ChannelEvent),
    /// Handshake acknowledgements, errors and keepalives
    Control(String),
}

/// Decode a text frame; `None` when it is not a JSON event frame.
pub fn decode(text: &str) -> Option<Frame> {
    let frame: InboundFrame = serde_json::from_str(text).ok()?;
    let event = frame.event.trim().to_string();
    if event.is_empty() {
        return None;
    }
    if is_control_event(&event) {
        return Some(Frame::Control(event));
    }

    let data = match frame.data {
        Value::String(encoded) => serde_json::from_str(&encoded).unwrap_or(Value::String(encoded)),
        other => other,
    };
    let channel = frame
        .channel
        .map(|channel| channel.trim().to_string())
        .filter(|channel| !channel.is_empty())
        .unwrap_or_else(|| event.clone());

    Some(Frame::Event(ChannelEvent {
        channel,
        event,
        data,
    }))
}

fn is_control_event(event: &str) -> bool {
    matches!(event, "ping" | "pong" | "subscribe" | "unsubscribe")
        || event.ends_with(":subscription_succeeded")
        || event.ends_with(":error")
        || event.ends_with(":ping")
        || event.ends_with(":pong")
        || event.ends_with(":connection_established")
}

/// Outbound subscribe handshake for `channel`
pub fn subscribe_frame(channel: &str) -> String {
    json!({"event": "subscribe", "data": {"channel": channel}}).to_string()
}
