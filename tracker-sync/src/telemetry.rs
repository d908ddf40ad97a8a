//! Tracing subscriber setup for hosts that do not install their own

use crate::error::{SyncError, SyncResult};
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_FILTER: &str = "tracker_sync=info,sqlx=warn";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// JSON lines instead of human-readable output
    pub json: bool,
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json: false,
            filter: DEFAULT_FILTER.to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn json() -> Self {
        Self {
            json: true,
            ..Self::default()
        }
    }
}

/// Install the global subscriber. Fails when one is already installed.
pub fn init_tracing(config: TelemetryConfig) -> SyncResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .map_err(|e| SyncError::Config(format!("Invalid log filter {:?}: {}", config.filter, e)))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.json {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init()
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_level(true),
            )
            .try_init()
    };

    result.map_err(|e| SyncError::Internal(format!("Tracing already initialized: {}", e)))
}
