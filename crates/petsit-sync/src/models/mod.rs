//! Data models for petsit-sync

mod location;
mod message;
mod notification;
mod record;

pub use location::{haversine_km, Coordinates, SitterLocation};
pub use message::{conversation_id, message_record_id, Conversation, Message, MessageKind};
pub use notification::{Notification, NotificationKind, PUSH_EVENTS};
pub use record::{parse_timestamp, Collection, Origin, Record, RecordError};
