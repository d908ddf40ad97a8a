//! Offline-first synchronization core for tracker clients
//!
//! Provides:
//! - Local SQLite store with mutation state and failure ledgers
//! - Reconciliation of server deltas with clean local records
//! - Diff-to-operation compiler and transactional batch executor
//! - Inbound pipeline with composite subtree regeneration and scoped watermarks
//! - Outbound pipeline with parent-first ordering and failure bookkeeping

pub mod batch;
pub mod cascade;
pub mod config;
pub mod diff;
pub mod error;
pub mod failure;
pub mod http;
pub mod inbound;
pub mod local_db;
pub mod outbound;
pub mod reconcile;
pub mod record;
pub mod registry;
pub mod remote;
pub mod state;
pub mod telemetry;
pub mod watermark;

pub use batch::BatchOutcome;
pub use config::SyncConfig;
pub use diff::{compile, Operation};
pub use error::{FailureClass, RemoteError, SyncError, SyncResult};
pub use failure::{FailureEntry, PushFailure};
pub use http::{HttpConnection, HttpResourceClient, HttpServerClock};
pub use inbound::{InboundFailure, InboundPipeline, InboundReport, PullReport, SyncTarget};
pub use local_db::{LocalDatabase, LocalDbConfig};
pub use outbound::{OutboundPipeline, PushOutcome, PushReport};
pub use reconcile::{attach_pending, reconcile};
pub use record::{Record, RecordKind, Uid};
pub use registry::{RegistryBuilder, ResourceBinding, ResourceRegistry};
pub use remote::{
    ImportConflict, ImportResult, ImportStatus, RemoteResource, ResourceQuery, ServerClock,
};
pub use state::{MutationState, StateSnapshot};
pub use telemetry::{init_tracing, TelemetryConfig};

use std::sync::Arc;

/// Reports of a full sync run
#[derive(Debug, Default, Clone)]
pub struct SyncStats {
    pub push: PushReport,
    pub pull: PullReport,
}

/// Sync engine for offline-first operations
pub struct SyncEngine {
    local_db: Arc<LocalDatabase>,
    registry: Arc<ResourceRegistry>,
}

impl SyncEngine {
    /// Open the local database and wire it to the registered resources
    pub async fn new(config: LocalDbConfig, registry: ResourceRegistry) -> SyncResult<Self> {
        let local_db = LocalDatabase::new(config).await?;
        Ok(Self::with_database(Arc::new(local_db), Arc::new(registry)))
    }

    pub fn with_database(local_db: Arc<LocalDatabase>, registry: Arc<ResourceRegistry>) -> Self {
        Self { local_db, registry }
    }

    /// Get the local database
    pub fn local_db(&self) -> &LocalDatabase {
        &self.local_db
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn inbound(&self) -> InboundPipeline {
        InboundPipeline::new(self.local_db.clone(), self.registry.clone())
    }

    pub fn outbound(&self) -> OutboundPipeline {
        OutboundPipeline::new(self.local_db.clone(), self.registry.clone())
    }

    /// Pull every registered resource
    pub async fn pull(&self) -> PullReport {
        self.inbound().run_all().await
    }

    pub async fn pull_targets(&self, targets: &[SyncTarget]) -> PullReport {
        self.inbound().run(targets).await
    }

    pub async fn push(&self) -> SyncResult<PushReport> {
        self.outbound().push().await
    }

    /// Perform full sync: push local edits, then pull server changes
    pub async fn sync(&self) -> SyncResult<SyncStats> {
        let push = self.push().await?;
        let pull = self.pull().await;

        tracing::info!(
            pushed = push.pushed,
            push_failed = push.failed,
            deferred = push.deferred,
            pulled = pull.completed.len(),
            pull_failed = pull.failed.len(),
            "Sync run finished"
        );

        Ok(SyncStats { push, pull })
    }
}
