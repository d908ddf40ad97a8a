//! Contracts of the remote collaborators
//!
//! The sync core talks to the server only through [`RemoteResource`]
//! (one per record kind) and [`ServerClock`]. Transport and wire format
//! live behind these traits; see [`crate::http`] for the HTTP adapter.

use crate::error::RemoteError;
use crate::record::{Record, Uid};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounds of a listing or delta fetch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceQuery {
    /// Only records changed after this server time
    pub since: Option<DateTime<Utc>>,
    /// Secondary scoping key, e.g. the UID of a parent program
    pub scope: Option<String>,
}

impl ResourceQuery {
    pub fn new(since: Option<DateTime<Utc>>, scope: Option<&str>) -> Self {
        Self {
            since,
            scope: scope.map(str::to_string),
        }
    }
}

/// Overall status of an import envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Success,
    /// Accepted, possibly with warnings
    Ok,
    Error,
}

/// A single server-side objection to an imported record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportConflict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<String>,
    pub value: String,
}

/// Server response envelope for create, update and delete requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub status: ImportStatus,
    #[serde(default, rename = "httpStatusCode", skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ImportConflict>,
}

impl ImportResult {
    pub fn success() -> Self {
        Self {
            status: ImportStatus::Success,
            http_status: Some(200),
            description: None,
            conflicts: Vec::new(),
        }
    }

    pub fn error(http_status: u16, description: impl Into<String>) -> Self {
        Self {
            status: ImportStatus::Error,
            http_status: Some(http_status),
            description: Some(description.into()),
            conflicts: Vec::new(),
        }
    }

    pub fn with_conflict(mut self, object: Option<&str>, value: impl Into<String>) -> Self {
        self.conflicts.push(ImportConflict {
            object: object.map(str::to_string),
            value: value.into(),
        });
        self
    }

    /// `Success` and `Ok` both take the success path
    pub fn is_success(&self) -> bool {
        matches!(self.status, ImportStatus::Success | ImportStatus::Ok)
    }

    /// Human-readable reason for a rejection
    pub fn failure_message(&self) -> String {
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            return description.to_string();
        }
        if !self.conflicts.is_empty() {
            return self
                .conflicts
                .iter()
                .map(|c| match &c.object {
                    Some(object) => format!("{}: {}", object, c.value),
                    None => c.value.clone(),
                })
                .collect::<Vec<_>>()
                .join("; ");
        }
        "Import rejected by server".to_string()
    }
}

/// Remote API for one record kind
#[async_trait]
pub trait RemoteResource: Send + Sync {
    /// Identities of every record on the server
    async fn list_basic(&self, query: &ResourceQuery) -> Result<Vec<Uid>, RemoteError>;

    /// Full records changed since `query.since`. Composite parents carry
    /// their children; leaving the array out keeps the stored subtree.
    async fn fetch_full(&self, query: &ResourceQuery) -> Result<Vec<Record>, RemoteError>;

    async fn create(&self, record: &Record) -> Result<ImportResult, RemoteError>;

    async fn update(&self, record: &Record) -> Result<ImportResult, RemoteError>;

    async fn delete(&self, uid: &Uid) -> Result<ImportResult, RemoteError>;

    /// Current server copy of one record, used to refresh server-assigned
    /// timestamps after a push
    async fn fetch_one(&self, uid: &Uid) -> Result<Record, RemoteError>;
}

/// The server's clock. The device clock is never used for watermarks.
#[async_trait]
pub trait ServerClock: Send + Sync {
    async fn now(&self) -> Result<DateTime<Utc>, RemoteError>;
}
