//! Outbound sync pipeline
//!
//! Pushes every record with a pending mutation to the server. Records
//! whose parent the server has never seen are deferred to a later cycle.
//! A record is pushed only after its parent, when both are pending.
//!
//! A failed push never escapes the pipeline. It is written to the failure
//! ledger and the record stays in its pending state for the next cycle.

use crate::error::{FailureClass, RemoteError, SyncError, SyncResult};
use crate::failure::{clear_failure_row, PushFailure};
use crate::local_db::{require_local_id, update_row, LocalDatabase};
use crate::record::{Record, RecordKind, Uid};
use crate::registry::{ResourceBinding, ResourceRegistry};
use crate::remote::ImportResult;
use crate::state::{set_state_row, MutationState};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::Instrument;

const PENDING_STATES: [MutationState; 3] = [
    MutationState::PendingCreate,
    MutationState::PendingUpdate,
    MutationState::PendingDelete,
];

/// HTTP status recorded for an `Error` import result that carries none
const DEFAULT_REJECTION_STATUS: u16 = 409;

/// Result of pushing one record
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// The server accepted the record; holds the refreshed local copy
    Pushed(Record),
    Failed(PushFailure),
    /// The parent has not reached the server yet
    Deferred,
}

/// Counts of one outbound run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PushReport {
    pub pushed: usize,
    pub failed: usize,
    pub deferred: usize,
}

impl PushReport {
    fn count(&mut self, outcome: &PushOutcome) {
        match outcome {
            PushOutcome::Pushed(_) => self.pushed += 1,
            PushOutcome::Failed(_) => self.failed += 1,
            PushOutcome::Deferred => self.deferred += 1,
        }
    }
}

struct Candidate<'a> {
    binding: &'a ResourceBinding,
    record: Record,
    state: MutationState,
}

pub struct OutboundPipeline {
    db: Arc<LocalDatabase>,
    registry: Arc<ResourceRegistry>,
}

impl OutboundPipeline {
    pub fn new(db: Arc<LocalDatabase>, registry: Arc<ResourceRegistry>) -> Self {
        Self { db, registry }
    }

    /// Push pending records of every registered kind
    pub async fn push(&self) -> SyncResult<PushReport> {
        let bindings: Vec<&ResourceBinding> = self.registry.bindings().iter().collect();
        self.push_bindings(&bindings).await
    }

    /// Push pending records of the given kinds only
    pub async fn push_kinds(&self, kinds: &[RecordKind]) -> SyncResult<PushReport> {
        let selected: HashSet<&RecordKind> = kinds.iter().collect();
        for kind in &selected {
            self.registry.get(kind)?;
        }
        let bindings: Vec<&ResourceBinding> = self
            .registry
            .bindings()
            .iter()
            .filter(|b| selected.contains(&b.kind))
            .collect();
        self.push_bindings(&bindings).await
    }

    /// Push a single stored record, regardless of its dependents
    pub async fn push_one(&self, uid: &Uid) -> SyncResult<PushOutcome> {
        let record = self
            .db
            .query_by_uid(uid)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("record {}", uid)))?;
        let binding = self.registry.get(&record.kind)?;
        let local_id = require_local_id(&record)?;

        let state = self
            .db
            .state_of(&record.kind, local_id)
            .await?
            .filter(|state| *state != MutationState::Synced)
            .ok_or_else(|| {
                SyncError::InvalidOperation(format!(
                    "{} {} has nothing to push",
                    record.kind, uid
                ))
            })?;

        if self.awaits_parent(&record).await? {
            return Ok(PushOutcome::Deferred);
        }

        let candidate = Candidate { binding, record, state };
        Ok(self.push_candidate(&candidate).await)
    }

    /// Errors only when the pending records cannot be read
    async fn push_bindings(&self, bindings: &[&ResourceBinding]) -> SyncResult<PushReport> {
        let mut report = PushReport::default();

        let mut candidates = Vec::new();
        for &binding in bindings {
            let states = self.db.states_for(&binding.kind).await?;
            for record in self.db.records_in_states(&binding.kind, &PENDING_STATES).await? {
                let Some(state) = record.local_id.and_then(|id| states.get(&id)).copied() else {
                    continue;
                };
                candidates.push(Candidate { binding, record, state });
            }
        }

        // deferral is decided before anything is pushed, so a child waits
        // one cycle even when its parent goes through in this one
        let mut eligible = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if self.awaits_parent(&candidate.record).await? {
                tracing::debug!(
                    kind = %candidate.record.kind,
                    uid = %candidate.record.uid,
                    "Deferring push until parent is synced"
                );
                report.count(&PushOutcome::Deferred);
            } else {
                eligible.push(candidate);
            }
        }

        for index in push_order(&eligible) {
            let outcome = self.push_candidate(&eligible[index]).await;
            report.count(&outcome);
        }

        tracing::info!(
            pushed = report.pushed,
            failed = report.failed,
            deferred = report.deferred,
            "Outbound run finished"
        );

        Ok(report)
    }

    async fn awaits_parent(&self, record: &Record) -> SyncResult<bool> {
        let Some(parent) = &record.parent else {
            return Ok(false);
        };
        Ok(self.db.state_of_uid(parent).await? == Some(MutationState::PendingCreate))
    }

    async fn push_candidate(&self, candidate: &Candidate<'_>) -> PushOutcome {
        let record = &candidate.record;
        let span = tracing::info_span!(
            "outbound_push",
            kind = %record.kind,
            uid = %record.uid,
            state = candidate.state.as_str()
        );

        async {
            let outcome = match self.attempt(candidate).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "Local storage failed during push");
                    PushOutcome::Failed(PushFailure::new(
                        FailureClass::Unexpected,
                        None,
                        e.to_string(),
                    ))
                }
            };

            if let PushOutcome::Failed(failure) = &outcome {
                tracing::warn!(
                    class = failure.class.as_str(),
                    status_code = ?failure.status_code,
                    message = %failure.message,
                    "Push failed"
                );
                if let Some(local_id) = record.local_id {
                    if let Err(e) = self.db.record_failure(&record.kind, local_id, failure).await {
                        tracing::error!(error = %e, "Could not record push failure");
                    }
                }
            }

            outcome
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, candidate: &Candidate<'_>) -> SyncResult<PushOutcome> {
        let remote = &candidate.binding.remote;
        let record = &candidate.record;

        let response = match candidate.state {
            MutationState::PendingCreate => remote.create(record).await,
            MutationState::PendingUpdate => remote.update(record).await,
            MutationState::PendingDelete => remote.delete(&record.uid).await,
            MutationState::Synced => return Ok(PushOutcome::Pushed(record.clone())),
        };

        let deleting = candidate.state == MutationState::PendingDelete;
        match response {
            Ok(result) if result.is_success() => self.on_success(candidate).await,
            Ok(result) if deleting && result.http_status == Some(404) => {
                self.on_success(candidate).await
            }
            Ok(result) => Ok(PushOutcome::Failed(rejection(&result))),
            Err(RemoteError::Http { status: 404, .. }) if deleting => {
                self.on_success(candidate).await
            }
            Err(e) => Ok(PushOutcome::Failed(PushFailure::new(
                e.class(),
                e.status_code(),
                e.to_string(),
            ))),
        }
    }

    async fn on_success(&self, candidate: &Candidate<'_>) -> SyncResult<PushOutcome> {
        let record = &candidate.record;
        let local_id = require_local_id(record)?;

        if candidate.state == MutationState::PendingDelete {
            self.db.delete(record).await?;
            tracing::debug!(local_id, "Deletion pushed");
            return Ok(PushOutcome::Pushed(record.clone()));
        }

        let mut tx = self.db.pool().begin().await?;
        set_state_row(&mut *tx, &record.kind, local_id, MutationState::Synced).await?;
        clear_failure_row(&mut *tx, &record.kind, local_id).await?;
        update_row(&mut *tx, local_id, record).await?;
        tx.commit().await?;

        let refreshed = match candidate.binding.remote.fetch_one(&record.uid).await {
            Ok(server) => {
                let refreshed = with_server_timestamps(record, &server);
                self.db.update(&refreshed).await?;
                refreshed
            }
            Err(e) => {
                // the push itself went through; timestamps catch up on the next pull
                tracing::warn!(error = %e, "Could not refresh server timestamps");
                record.clone()
            }
        };

        tracing::debug!(local_id, "Record pushed");
        Ok(PushOutcome::Pushed(refreshed))
    }
}

fn rejection(result: &ImportResult) -> PushFailure {
    PushFailure {
        class: FailureClass::Rejected,
        status_code: Some(result.http_status.unwrap_or(DEFAULT_REJECTION_STATUS)),
        message: result.failure_message(),
        conflicts: result.conflicts.clone(),
    }
}

fn with_server_timestamps(record: &Record, server: &Record) -> Record {
    let mut refreshed = record.clone();
    if server.created.is_some() {
        refreshed.created = server.created;
    }
    if server.last_modified != DateTime::<Utc>::default() {
        refreshed.last_modified = server.last_modified;
    }
    refreshed
}

/// Indices of `candidates` in push order: candidate order, except that a
/// record whose parent is also pending comes right after that parent
/// (depth first).
fn push_order(candidates: &[Candidate<'_>]) -> Vec<usize> {
    let position: HashMap<&Uid, usize> = candidates
        .iter()
        .enumerate()
        .map(|(i, c)| (&c.record.uid, i))
        .collect();

    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut has_pending_parent = vec![false; candidates.len()];
    for (i, candidate) in candidates.iter().enumerate() {
        let parent = candidate.record.parent.as_ref().and_then(|p| position.get(p));
        if let Some(&parent) = parent.filter(|&&p| p != i) {
            dependents.entry(parent).or_default().push(i);
            has_pending_parent[i] = true;
        }
    }

    let mut order = Vec::with_capacity(candidates.len());
    let mut visited = vec![false; candidates.len()];

    // roots first, then anything left over by a parent cycle
    let roots = (0..candidates.len()).filter(|&i| !has_pending_parent[i]);
    let rest = 0..candidates.len();
    for start in roots.chain(rest) {
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            if visited[i] {
                continue;
            }
            visited[i] = true;
            order.push(i);
            if let Some(children) = dependents.get(&i) {
                stack.extend(children.iter().rev());
            }
        }
    }

    order
}
