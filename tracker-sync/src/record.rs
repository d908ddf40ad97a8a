//! Synchronizable records and their identifiers
//!
//! A record is joined across devices and the server by its [`Uid`]. The
//! numeric `local_id` belongs to local storage only and is never
//! serialized towards the server.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of identifiers generated on the device
pub const UID_LENGTH: usize = 11;

const UID_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const UID_ALPHANUMERIC: &[u8] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Globally unique, stable record identifier
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Generate a fresh identifier for a record created offline.
    ///
    /// The first character is always a letter, the rest are alphanumeric.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut value = String::with_capacity(UID_LENGTH);
        value.push(char::from(UID_LETTERS[rng.gen_range(0..UID_LETTERS.len())]));
        for _ in 1..UID_LENGTH {
            value.push(char::from(
                UID_ALPHANUMERIC[rng.gen_range(0..UID_ALPHANUMERIC.len())],
            ));
        }
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A usable identifier is anything but blank
    pub fn is_valid(&self) -> bool {
        !self.0.trim().is_empty()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Uid {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Resource type a record belongs to (e.g. "program", "event")
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKind(String);

impl RecordKind {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordKind {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A synchronizable entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Identity assigned by local storage
    #[serde(skip)]
    pub local_id: Option<i64>,

    #[serde(rename = "id", default)]
    pub uid: Uid,

    #[serde(default, skip_serializing_if = "RecordKind::is_empty")]
    pub kind: RecordKind,

    /// Server-assigned creation time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    #[serde(rename = "lastUpdated", default)]
    pub last_modified: DateTime<Utc>,

    /// Required parent reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<Uid>,

    /// Secondary key the record is synchronized under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,

    /// Kind-specific fields
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Owned child collections of a composite record, as fetched from the
    /// server. `None` when the response carried no children array, which
    /// is not the same as an empty one. Children are stored as records of
    /// their own, never inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<Record>>,
}

impl Record {
    pub fn new(
        kind: impl Into<RecordKind>,
        uid: impl Into<Uid>,
        last_modified: DateTime<Utc>,
    ) -> Self {
        Self {
            local_id: None,
            uid: uid.into(),
            kind: kind.into(),
            created: None,
            last_modified,
            parent: None,
            scope: None,
            payload: serde_json::Value::Null,
            children: None,
        }
    }

    pub fn with_local_id(mut self, local_id: i64) -> Self {
        self.local_id = Some(local_id);
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn with_parent(mut self, parent: impl Into<Uid>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_children(mut self, children: Vec<Record>) -> Self {
        self.children = Some(children);
        self
    }

    /// Detach the owned children, leaving the record itself
    pub fn take_children(&mut self) -> Option<Vec<Record>> {
        self.children.take()
    }
}
