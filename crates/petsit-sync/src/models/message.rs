//! Message and conversation payloads

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    BookingConfirmation,
    BookingCancellation,
    System,
}

impl MessageKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::BookingConfirmation => "booking_confirmation",
            Self::BookingCancellation => "booking_cancellation",
            Self::System => "system",
        }
    }

    /// Parse the server's `type` column; unknown values are plain text
    pub fn from_wire(value: &str) -> Self {
        match value {
            "booking_confirmation" => Self::BookingConfirmation,
            "booking_cancellation" => Self::BookingCancellation,
            "system" => Self::System,
            _ => Self::Text,
        }
    }
}

/// Payload of a `messages` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender_id: String,
    pub receiver_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub kind: MessageKind,
    /// Correlation id generated on the sending device
    #[serde(default)]
    pub client_generated_id: Option<String>,
    #[serde(default)]
    pub server_id: Option<String>,
    /// Server creation time (Unix ms); the local write time until confirmed
    #[serde(default)]
    pub sent_at: Option<i64>,
    #[serde(default)]
    pub read: bool,
    /// Written locally and not yet confirmed by the server
    #[serde(default)]
    pub pending: bool,
}

impl Message {
    /// Record id under which this message is stored
    pub fn record_id(&self) -> Option<String> {
        if let Some(client_id) = self.client_generated_id.as_deref() {
            return Some(message_record_id(&self.sender_id, &self.receiver_id, client_id));
        }
        self.server_id.as_deref().map(|server_id| format!("srv:{server_id}"))
    }

    /// Whether `user_id` takes part in this message
    pub fn involves(&self, user_id: &str) -> bool {
        self.sender_id == user_id || self.receiver_id == user_id
    }
}

/// Correlation key shared by an optimistic message and its confirmation
pub fn message_record_id(sender_id: &str, receiver_id: &str, client_generated_id: &str) -> String {
    format!("msg:{sender_id}:{receiver_id}:{client_generated_id}")
}

/// Conversation id for two participants: ids sorted (numerically when both
/// are integers) and joined with `_`.
pub fn conversation_id(a: &str, b: &str) -> String {
    let ordering = match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(left), Ok(right)) => left.cmp(&right),
        _ => a.cmp(b),
    };
    match ordering {
        Ordering::Greater => format!("{b}_{a}"),
        Ordering::Less | Ordering::Equal => format!("{a}_{b}"),
    }
}

/// Payload of a `conversations` record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub other_user_name: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<i64>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// The participant that is not `user_id`
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .map(String::as_str)
            .find(|participant| *participant != user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_id_sorts_numeric_ids_numerically() {
        assert_eq!(conversation_id("12", "9"), "9_12");
        assert_eq!(conversation_id("9", "12"), "9_12");
        assert_eq!(conversation_id("bob", "alice"), "alice_bob");
    }

    #[test]
    fn record_id_prefers_client_correlation_key() {
        let mut message = Message {
            sender_id: "7".to_string(),
            receiver_id: "9".to_string(),
            conversation_id: None,
            text: "On my way".to_string(),
            kind: MessageKind::Text,
            client_generated_id: Some("c-1".to_string()),
            server_id: Some("501".to_string()),
            sent_at: None,
            read: false,
            pending: false,
        };
        assert_eq!(message.record_id().as_deref(), Some("msg:7:9:c-1"));

        message.client_generated_id = None;
        assert_eq!(message.record_id().as_deref(), Some("srv:501"));

        message.server_id = None;
        assert_eq!(message.record_id(), None);
    }

    #[test]
    fn unknown_wire_kind_is_text() {
        assert_eq!(MessageKind::from_wire("booking_cancellation"), MessageKind::BookingCancellation);
        assert_eq!(MessageKind::from_wire("sticker"), MessageKind::Text);
    }

    #[test]
    fn other_participant_skips_self() {
        let conversation = Conversation {
            participant_ids: vec!["7".to_string(), "9".to_string()],
            other_user_name: None,
            last_message: None,
            last_message_at: None,
            unread_count: 0,
        };
        assert_eq!(conversation.other_participant("7"), Some("9"));
    }
}
