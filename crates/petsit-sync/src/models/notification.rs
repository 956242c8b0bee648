//! Notification payload and push event mapping

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broad category used by the UI for icons and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Booking,
    Message,
    Review,
    Payment,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: NotificationKind,
    /// Server event that produced the notification
    pub event: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub data: Value,
}

/// Push events the server emits for notifications without a record envelope
pub const PUSH_EVENTS: [&str; 13] = [
    "booking.status.updated",
    "id.verification.updated",
    "profile-change-approved",
    "profile-change-rejected",
    "session.started",
    "booking.completed",
    "booking.confirmed",
    "review.created",
    "payment.success",
    "payment.received",
    "wallet.updated",
    "dashboard.updated",
    "notification.received",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Topic {
    ProfileChange,
    Verification,
    Booking,
    Review,
    Payment,
    Other,
}

impl Topic {
    const fn kind(self) -> NotificationKind {
        match self {
            Self::ProfileChange | Self::Verification | Self::Other => NotificationKind::System,
            Self::Booking => NotificationKind::Booking,
            Self::Review => NotificationKind::Review,
            Self::Payment => NotificationKind::Payment,
        }
    }

    const fn action(self) -> &'static str {
        match self {
            Self::ProfileChange => "View Profile",
            Self::Verification => "View Verification",
            Self::Booking => "View Booking",
            Self::Review => "View Reviews",
            Self::Payment | Self::Other => "View Details",
        }
    }

    fn from_type_name(name: &str) -> Self {
        match name {
            "profile_change_approved" | "profile_change_rejected" => Self::ProfileChange,
            "id_verification_approved" | "id_verification_rejected" | "id_verification_updated" => {
                Self::Verification
            }
            "booking_confirmed" | "booking_cancelled" | "booking_updated" | "session_started"
            | "booking_completed" | "booking" => Self::Booking,
            "new_review" | "review" => Self::Review,
            "payment_success" | "payment_received" | "wallet_updated" | "payment" => Self::Payment,
            _ => Self::Other,
        }
    }
}

impl Notification {
    /// Build a notification from a legacy push event.
    ///
    /// Returns `None` for events that do not produce a notification.
    pub fn from_push_event(event: &str, data: &Value) -> Option<Self> {
        let text = |key: &str| {
            data.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };
        let message_or = |fallback: &str| text("message").unwrap_or_else(|| fallback.to_string());

        let (topic, title, message, body) = match event {
            "profile-change-approved" => (
                Topic::ProfileChange,
                "Profile Update Approved".to_string(),
                message_or("Your profile update request has been approved!"),
                data.clone(),
            ),
            "profile-change-rejected" => (
                Topic::ProfileChange,
                "Profile Update Rejected".to_string(),
                message_or("Your profile update request has been rejected."),
                data.clone(),
            ),
            "id.verification.updated" => {
                let status = nested_status(data, "verification");
                let (title, fallback) = match status.as_deref() {
                    Some("approved") => (
                        "ID Verification Approved",
                        "Your ID verification has been approved! Your account is now verified.",
                    ),
                    Some("rejected") => (
                        "ID Verification Rejected",
                        "Your ID verification has been rejected.",
                    ),
                    _ => (
                        "ID Verification Updated",
                        "Your ID verification status has been updated.",
                    ),
                };
                (
                    Topic::Verification,
                    title.to_string(),
                    message_or(fallback),
                    data.get("verification").cloned().unwrap_or_else(|| data.clone()),
                )
            }
            "booking.status.updated" => {
                let status = nested_status(data, "booking");
                let (title, message) = match status.as_deref() {
                    Some("confirmed") => (
                        "Booking Confirmed",
                        "Your booking has been confirmed by the pet sitter!",
                    ),
                    Some("cancelled") => ("Booking Cancelled", "Your booking has been cancelled."),
                    _ => ("Booking Updated", "Your booking status has been updated."),
                };
                (
                    Topic::Booking,
                    title.to_string(),
                    message.to_string(),
                    data.get("booking").cloned().unwrap_or_else(|| data.clone()),
                )
            }
            "session.started" => (
                Topic::Booking,
                "Session Started".to_string(),
                message_or("Your sitter has started the session."),
                data.clone(),
            ),
            "booking.completed" => (
                Topic::Booking,
                "Booking Completed".to_string(),
                message_or("Your booking has been completed."),
                data.clone(),
            ),
            "booking.confirmed" => (
                Topic::Booking,
                "Booking Confirmed".to_string(),
                message_or("A new booking has been confirmed for you!"),
                data.clone(),
            ),
            "review.created" => (
                Topic::Review,
                "New Review Received".to_string(),
                message_or("You received a new review!"),
                data.clone(),
            ),
            "payment.success" => (
                Topic::Payment,
                "Payment Successful".to_string(),
                message_or("Your payment has been processed successfully!"),
                data.clone(),
            ),
            "payment.received" => {
                let amount = data
                    .get("payment")
                    .and_then(|payment| payment.get("sitter_share").or_else(|| payment.get("amount")))
                    .map_or_else(|| "0".to_string(), display_amount);
                (
                    Topic::Payment,
                    "Payment Received".to_string(),
                    message_or(&format!("You received ₱{amount} for your service!")),
                    data.clone(),
                )
            }
            "wallet.updated" => {
                let balance = data
                    .get("wallet_balance")
                    .map_or_else(|| "0".to_string(), display_amount);
                (
                    Topic::Payment,
                    "Wallet Updated".to_string(),
                    message_or(&format!("Your wallet balance is now ₱{balance}")),
                    data.clone(),
                )
            }
            "dashboard.updated" => (
                Topic::Other,
                "Dashboard Updated".to_string(),
                message_or("Your dashboard has been updated with new information."),
                data.clone(),
            ),
            "notification.received" => (
                text("type").map_or(Topic::Booking, |name| Topic::from_type_name(&name)),
                text("title").unwrap_or_else(|| "Notification".to_string()),
                message_or("You have a new notification."),
                data.clone(),
            ),
            _ => return None,
        };

        Some(Self {
            kind: topic.kind(),
            event: event.to_string(),
            title,
            message,
            action: Some(topic.action().to_string()),
            read: false,
            data: body,
        })
    }

    /// Build a notification from a row of `GET /api/notifications`
    /// (`{type, title, message, read_at, data}`).
    pub fn from_listing(row: &Value) -> Self {
        let text = |key: &str| {
            row.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };
        let type_name = text("type").unwrap_or("system");
        let topic = Topic::from_type_name(type_name);
        Self {
            kind: topic.kind(),
            event: type_name.to_string(),
            title: text("title").unwrap_or("Notification").to_string(),
            message: text("message").unwrap_or_default().to_string(),
            action: Some(topic.action().to_string()),
            read: row.get("read").and_then(Value::as_bool).unwrap_or(false)
                || row.get("read_at").is_some_and(|read_at| !read_at.is_null()),
            data: row.get("data").cloned().unwrap_or(Value::Null),
        }
    }
}

fn nested_status(data: &Value, container: &str) -> Option<String> {
    data.get("status")
        .or_else(|| data.get(container).and_then(|inner| inner.get("status")))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn display_amount(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
