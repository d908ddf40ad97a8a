//! Transactional batch executor
//!
//! Applies a compiled operation list inside one SQLite transaction. Any
//! failing operation rolls back the whole batch, so readers see either all
//! of it or none of it. An insert never lands on a stored row that still
//! has a pending mutation.

use crate::diff::Operation;
use crate::error::{SyncError, SyncResult};
use crate::local_db::{delete_row, require_local_id, update_row, upsert_row, LocalDatabase};
use crate::state::{set_state_row, state_of_uid_row, MutationState};
use sqlx::sqlite::SqliteConnection;

/// Row counts of a committed batch
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl LocalDatabase {
    /// Apply `operations` atomically.
    ///
    /// Inserted and updated records are marked `Synced`: they now mirror
    /// the server. Deleted records lose their ledger and failure entries.
    pub async fn execute(&self, operations: &[Operation]) -> SyncResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        if operations.is_empty() {
            return Ok(outcome);
        }

        let mut tx = self.pool().begin().await?;
        for operation in operations {
            apply_operation(&mut *tx, operation, &mut outcome).await?;
        }
        tx.commit().await?;

        tracing::debug!(
            inserted = outcome.inserted,
            updated = outcome.updated,
            deleted = outcome.deleted,
            "Committed operation batch"
        );

        Ok(outcome)
    }
}

async fn apply_operation(
    conn: &mut SqliteConnection,
    operation: &Operation,
    outcome: &mut BatchOutcome,
) -> SyncResult<()> {
    match operation {
        Operation::Insert(record) => {
            if let Some(state) = state_of_uid_row(&mut *conn, &record.uid)
                .await?
                .filter(MutationState::is_pending)
            {
                tracing::debug!(
                    kind = %record.kind,
                    uid = %record.uid,
                    state = state.as_str(),
                    "Skipping insert over a record with a pending mutation"
                );
                return Ok(());
            }
            let local_id = upsert_row(&mut *conn, record).await?;
            set_state_row(&mut *conn, &record.kind, local_id, MutationState::Synced).await?;
            outcome.inserted += 1;
        }
        Operation::Update(record) => {
            let local_id = require_local_id(record)?;
            if update_row(&mut *conn, local_id, record).await? == 0 {
                return Err(SyncError::NotFound(format!(
                    "{} {} (local id {})",
                    record.kind, record.uid, local_id
                )));
            }
            set_state_row(&mut *conn, &record.kind, local_id, MutationState::Synced).await?;
            outcome.updated += 1;
        }
        Operation::Delete(record) => {
            let local_id = require_local_id(record)?;
            delete_row(&mut *conn, &record.kind, local_id).await?;
            outcome.deleted += 1;
        }
    }
    Ok(())
}
