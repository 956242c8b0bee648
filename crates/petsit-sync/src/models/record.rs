//! Record model shared by every collection

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A named, independent set of records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Notifications,
    SitterLocations,
    Messages,
    Conversations,
}

impl Collection {
    pub const ALL: [Self; 4] = [
        Self::Notifications,
        Self::SitterLocations,
        Self::Messages,
        Self::Conversations,
    ];

    /// Table name in the local store
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Notifications => "notifications",
            Self::SitterLocations => "sitter_locations",
            Self::Messages => "messages",
            Self::Conversations => "conversations",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|collection| collection.as_str() == s)
            .ok_or_else(|| RecordError::UnknownCollection(s.to_string()))
    }
}

/// Where a record version was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Remote,
}

/// One versioned entity in a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    /// User id that owns the record; the basis of every subscription filter
    pub owner_scope: String,
    pub payload: Value,
    /// Logical timestamp (Unix ms)
    pub updated_at: i64,
    pub origin: Origin,
    #[serde(default)]
    pub tombstone: bool,
    /// Administrative undo-delete; lets a newer write replace a tombstone
    #[serde(default)]
    pub resurrect: bool,
}

impl Record {
    /// A record version produced on this device
    pub fn local(
        id: impl Into<String>,
        owner_scope: impl Into<String>,
        payload: Value,
        updated_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            owner_scope: owner_scope.into(),
            payload,
            updated_at,
            origin: Origin::Local,
            tombstone: false,
            resurrect: false,
        }
    }

    /// A record version received from the server
    pub fn remote(
        id: impl Into<String>,
        owner_scope: impl Into<String>,
        payload: Value,
        updated_at: i64,
    ) -> Self {
        Self {
            origin: Origin::Remote,
            ..Self::local(id, owner_scope, payload, updated_at)
        }
    }

    /// Deletion marker for this record at `updated_at`
    #[must_use]
    pub fn to_tombstone(&self, updated_at: i64, origin: Origin) -> Self {
        Self {
            id: self.id.clone(),
            owner_scope: self.owner_scope.clone(),
            payload: Value::Null,
            updated_at,
            origin,
            tombstone: true,
            resurrect: false,
        }
    }

    /// Serialize a typed payload into a record body
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Decode the payload into a typed model
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Same logical content, ignoring origin
    pub fn same_content(&self, other: &Self) -> bool {
        self.id == other.id
            && self.updated_at == other.updated_at
            && self.tombstone == other.tombstone
            && self.owner_scope == other.owner_scope
            && self.payload == other.payload
    }

    /// Parse a record from untrusted JSON.
    ///
    /// Ids and owner scopes may be integers and are stringified; `updated_at`
    /// may be milliseconds or an RFC 3339 / `YYYY-MM-DD HH:MM:SS` string.
    /// The result is always stamped `origin = remote`.
    pub fn from_untrusted(value: &Value) -> Result<Self, RecordError> {
        let object = value.as_object().ok_or(RecordError::NotAnObject)?;

        let id = key_field(object, &["id"], "id")?;
        let owner_scope = key_field(object, &["owner_scope", "ownerScope"], "owner_scope")?;
        let updated_at = timestamp_field(object)?;
        let tombstone = bool_field(object, "tombstone")?;
        let resurrect = bool_field(object, "resurrect")?;

        let payload = match object.get("payload") {
            Some(payload @ Value::Object(_)) => payload.clone(),
            None | Some(Value::Null) if tombstone => Value::Null,
            None | Some(Value::Null) => return Err(RecordError::MissingField("payload")),
            Some(_) => {
                return Err(RecordError::InvalidField {
                    field: "payload",
                    reason: "must be an object".to_string(),
                })
            }
        };

        Ok(Self {
            id,
            owner_scope,
            payload,
            updated_at,
            origin: Origin::Remote,
            tombstone,
            resurrect,
        })
    }
}

/// Why an untrusted record was refused
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),
}

fn key_field(
    object: &Map<String, Value>,
    keys: &[&str],
    field: &'static str,
) -> Result<String, RecordError> {
    let value = keys
        .iter()
        .find_map(|key| object.get(*key))
        .ok_or(RecordError::MissingField(field))?;
    let key = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) if number.is_i64() || number.is_u64() => number.to_string(),
        _ => {
            return Err(RecordError::InvalidField {
                field,
                reason: "must be a string or an integer".to_string(),
            })
        }
    };
    if key.is_empty() {
        return Err(RecordError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(key)
}

fn timestamp_field(object: &Map<String, Value>) -> Result<i64, RecordError> {
    let value = object
        .get("updated_at")
        .or_else(|| object.get("updatedAt"))
        .ok_or(RecordError::MissingField("updated_at"))?;
    let invalid = |reason: &str| RecordError::InvalidField {
        field: "updated_at",
        reason: reason.to_string(),
    };
    match value {
        Value::Number(number) => {
            let millis = number
                .as_i64()
                .ok_or_else(|| invalid("must be an integer number of milliseconds"))?;
            if millis < 0 {
                return Err(invalid("must not be negative"));
            }
            Ok(millis)
        }
        Value::String(text) => parse_timestamp(text).ok_or_else(|| invalid("unrecognized date")),
        _ => Err(invalid("must be a number or a date string")),
    }
}

/// Parse a server timestamp string into Unix milliseconds
pub fn parse_timestamp(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(text) {
        return Some(parsed.timestamp_millis());
    }
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

fn bool_field(object: &Map<String, Value>, field: &'static str) -> Result<bool, RecordError> {
    match object.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(_) => Err(RecordError::InvalidField {
            field,
            reason: "must be a boolean".to_string(),
        }),
    }
}
