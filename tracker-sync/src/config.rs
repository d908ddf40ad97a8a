//! Sync engine configuration
//!
//! Loaded from the environment (with an optional `.env` file) or from
//! YAML. Missing settings keep their defaults.

use crate::error::{SyncError, SyncResult};
use crate::local_db::LocalDbConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

const ENV_DB_PATH: &str = "TRACKER_SYNC_DB_PATH";
const ENV_SERVER_URL: &str = "TRACKER_SYNC_SERVER_URL";
const ENV_AUTH_TOKEN: &str = "TRACKER_SYNC_AUTH_TOKEN";
const ENV_MAX_CONNECTIONS: &str = "TRACKER_SYNC_MAX_CONNECTIONS";
const ENV_REQUEST_TIMEOUT_SECS: &str = "TRACKER_SYNC_REQUEST_TIMEOUT_SECS";
const ENV_PAGE_SIZE: &str = "TRACKER_SYNC_PAGE_SIZE";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Path to the local database file
    pub db_path: String,
    pub max_connections: u32,
    pub enable_wal: bool,
    pub enable_foreign_keys: bool,
    /// Server base URL
    pub server_url: String,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    pub request_timeout_secs: u64,
    /// Page size requested when listing
    pub page_size: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: "tracker_sync.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            enable_foreign_keys: true,
            server_url: "http://localhost:8080/api".to_string(),
            auth_token: None,
            request_timeout_secs: 30,
            page_size: 50,
        }
    }
}

impl SyncConfig {
    /// Read the configuration from `TRACKER_SYNC_*` variables, loading a
    /// `.env` file first when one exists
    pub fn from_env() -> SyncResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(SyncError::Config(format!("Failed to read .env file: {}", e)));
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_yaml_str(yaml: &str) -> SyncResult<Self> {
        let config: SyncConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> SyncResult<Self> {
        let mut config = Self::default();

        if let Some(db_path) = lookup(ENV_DB_PATH) {
            config.db_path = db_path;
        }
        if let Some(server_url) = lookup(ENV_SERVER_URL) {
            config.server_url = server_url;
        }
        if let Some(token) = lookup(ENV_AUTH_TOKEN).filter(|t| !t.is_empty()) {
            config.auth_token = Some(token);
        }
        if let Some(value) = lookup(ENV_MAX_CONNECTIONS) {
            config.max_connections = parse_var(ENV_MAX_CONNECTIONS, &value)?;
        }
        if let Some(value) = lookup(ENV_REQUEST_TIMEOUT_SECS) {
            config.request_timeout_secs = parse_var(ENV_REQUEST_TIMEOUT_SECS, &value)?;
        }
        if let Some(value) = lookup(ENV_PAGE_SIZE) {
            config.page_size = parse_var(ENV_PAGE_SIZE, &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.db_path.trim().is_empty() {
            return Err(SyncError::Config("db_path must not be empty".to_string()));
        }
        if self.server_url.trim().is_empty() {
            return Err(SyncError::Config("server_url must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(SyncError::Config("max_connections must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn local_db_config(&self) -> LocalDbConfig {
        LocalDbConfig {
            db_path: self.db_path.clone(),
            max_connections: self.max_connections,
            enable_wal: self.enable_wal,
            enable_foreign_keys: self.enable_foreign_keys,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> SyncResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| SyncError::Config(format!("Invalid {}={:?}: {}", name, value, e)))
}
