//! Inbound sync pipeline
//!
//! One cycle per resource (and scope): read the server clock, fetch the
//! identity listing and the delta since the watermark, reconcile against
//! the clean local records, compile the operations, expand composite
//! subtrees and commit everything in one batch. The watermark moves to
//! the server time read at the start of the cycle, and only after the
//! batch committed.

use crate::cascade;
use crate::diff::compile;
use crate::error::SyncResult;
use crate::local_db::LocalDatabase;
use crate::reconcile::{attach_pending, reconcile};
use crate::record::{Record, RecordKind};
use crate::registry::ResourceRegistry;
use crate::remote::ResourceQuery;
use crate::state::is_dirty;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::Instrument;

/// A resource, optionally narrowed to one scope key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub kind: RecordKind,
    pub scope: Option<String>,
}

impl SyncTarget {
    pub fn new(kind: impl Into<RecordKind>) -> Self {
        Self {
            kind: kind.into(),
            scope: None,
        }
    }

    pub fn scoped(kind: impl Into<RecordKind>, scope: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            scope: Some(scope.into()),
        }
    }
}

/// Outcome of one committed inbound cycle
#[derive(Debug, Clone, PartialEq)]
pub struct InboundReport {
    pub kind: RecordKind,
    pub scope: Option<String>,
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    pub children_regenerated: usize,
    /// New watermark of the resource
    pub watermark: DateTime<Utc>,
}

/// An aborted inbound cycle
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFailure {
    pub kind: RecordKind,
    pub scope: Option<String>,
    pub message: String,
}

/// Result of pulling several resources
#[derive(Debug, Default, Clone)]
pub struct PullReport {
    pub completed: Vec<InboundReport>,
    pub failed: Vec<InboundFailure>,
}

impl PullReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct InboundPipeline {
    db: Arc<LocalDatabase>,
    registry: Arc<ResourceRegistry>,
}

impl InboundPipeline {
    pub fn new(db: Arc<LocalDatabase>, registry: Arc<ResourceRegistry>) -> Self {
        Self { db, registry }
    }

    pub async fn sync_resource(&self, kind: &RecordKind) -> SyncResult<InboundReport> {
        self.sync_scope(kind, None).await
    }

    /// Run one inbound cycle. On error nothing was committed and the
    /// watermark is unchanged.
    pub async fn sync_scope(
        &self,
        kind: &RecordKind,
        scope: Option<&str>,
    ) -> SyncResult<InboundReport> {
        let span = tracing::info_span!(
            "inbound_sync",
            kind = %kind,
            scope = scope.unwrap_or_default()
        );
        self.cycle(kind, scope).instrument(span).await
    }

    /// Pull every target in order. A failed cycle is reported and the run
    /// moves on to the next target.
    pub async fn run(&self, targets: &[SyncTarget]) -> PullReport {
        let mut report = PullReport::default();

        for target in targets {
            match self.sync_scope(&target.kind, target.scope.as_deref()).await {
                Ok(cycle) => report.completed.push(cycle),
                Err(e) => {
                    tracing::warn!(
                        kind = %target.kind,
                        scope = target.scope.as_deref().unwrap_or_default(),
                        error = %e,
                        "Inbound cycle aborted"
                    );
                    report.failed.push(InboundFailure {
                        kind: target.kind.clone(),
                        scope: target.scope.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        report
    }

    /// Pull every registered resource without scope, in registration order
    pub async fn run_all(&self) -> PullReport {
        let targets: Vec<SyncTarget> = self
            .registry
            .kinds()
            .into_iter()
            .map(SyncTarget::new)
            .collect();
        self.run(&targets).await
    }

    async fn cycle(&self, kind: &RecordKind, scope: Option<&str>) -> SyncResult<InboundReport> {
        let binding = self.registry.get(kind)?;

        // read before fetching so changes made during the cycle are fetched again next time
        let server_time = self.registry.clock().now().await?;
        let watermark = self.db.watermark(kind, scope).await?;

        let server_all = binding.remote.list_basic(&ResourceQuery::new(None, scope)).await?;
        let mut server_delta = binding
            .remote
            .fetch_full(&ResourceQuery::new(watermark, scope))
            .await?;
        for record in &mut server_delta {
            record.kind = kind.clone();
            record.local_id = None;
            if let Some(scope) = scope {
                record.scope = Some(scope.to_string());
            }
        }

        tracing::debug!(
            listed = server_all.len(),
            changed = server_delta.len(),
            since = ?watermark,
            "Fetched server state"
        );

        let persisted = match scope {
            Some(scope) => self.db.query_scope(kind, scope).await?,
            None => self.db.query_all(kind).await?,
        };
        let states = self.db.states_for(kind).await?;
        let (pending, clean): (Vec<Record>, Vec<Record>) = persisted
            .iter()
            .cloned()
            .partition(|record| is_dirty(&states, record.local_id));

        let merged = attach_pending(reconcile(&server_all, &server_delta, &clean), pending);
        let operations = compile(&persisted, &merged, &states);
        let plan = cascade::expand(&self.db, binding, operations).await?;

        let outcome = self.db.execute(&plan.operations).await?;
        self.db.set_watermark(kind, server_time, scope).await?;

        tracing::info!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            deleted = outcome.deleted,
            children_regenerated = plan.children_regenerated,
            watermark = %server_time,
            "Inbound cycle committed"
        );

        Ok(InboundReport {
            kind: kind.clone(),
            scope: scope.map(str::to_string),
            inserted: outcome.inserted,
            updated: outcome.updated,
            deleted: outcome.deleted,
            children_regenerated: plan.children_regenerated,
            watermark: server_time,
        })
    }
}
