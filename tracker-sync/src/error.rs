//! Error types for the sync engine

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SyncError {
    fn from(err: serde_yaml::Error) -> Self {
        SyncError::Config(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

/// Error reported by a remote collaborator (resource client or server clock)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request never produced a response
    #[error("No response from server: {0}")]
    Transport(String),

    /// A response arrived but could not be interpreted
    #[error("Undecodable server response: {message}")]
    Decode { status: Option<u16>, message: String },

    /// The server answered with a non-2xx status
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

impl RemoteError {
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Transport(_) => FailureClass::Transport,
            RemoteError::Decode { .. } => FailureClass::Decode,
            RemoteError::Http { .. } => FailureClass::Rejected,
        }
    }

    /// HTTP status of the response, `None` when nothing came back
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RemoteError::Transport(_) => None,
            RemoteError::Decode { status, .. } => *status,
            RemoteError::Http { status, .. } => Some(*status),
        }
    }
}

/// Classification of a failed push
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// No response reached the device
    Transport,
    /// A response was received but could not be interpreted
    Decode,
    /// The server processed the request and refused the record
    Rejected,
    /// Anything else, e.g. a local storage failure mid-push
    Unexpected,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transport => "transport",
            FailureClass::Decode => "decode",
            FailureClass::Rejected => "rejected",
            FailureClass::Unexpected => "unexpected",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "transport" => Ok(FailureClass::Transport),
            "decode" => Ok(FailureClass::Decode),
            "rejected" => Ok(FailureClass::Rejected),
            "unexpected" => Ok(FailureClass::Unexpected),
            _ => Err(SyncError::InvalidOperation(format!("Unknown failure class: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        let transport = RemoteError::Transport("connection refused".to_string());
        assert_eq!(transport.class(), FailureClass::Transport);
        assert_eq!(transport.status_code(), None);

        let decode = RemoteError::Decode {
            status: Some(200),
            message: "expected value".to_string(),
        };
        assert_eq!(decode.class(), FailureClass::Decode);
        assert_eq!(decode.status_code(), Some(200));

        let http = RemoteError::Http {
            status: 500,
            message: "boom".to_string(),
        };
        assert_eq!(http.class(), FailureClass::Rejected);
        assert_eq!(http.status_code(), Some(500));
    }

    #[test]
    fn test_failure_class_string_roundtrip() {
        for class in [
            FailureClass::Transport,
            FailureClass::Decode,
            FailureClass::Rejected,
            FailureClass::Unexpected,
        ] {
            assert_eq!(FailureClass::from_str(class.as_str()).unwrap(), class);
        }
        assert!(FailureClass::from_str("timeout").is_err());
    }
}
