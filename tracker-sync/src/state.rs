//! Mutation state ledger
//!
//! Tracks, per (record kind, local identity), what must still happen to a
//! locally stored record. Writes go straight to the database. The ledger
//! does not police transitions; [`LocalDatabase::save_local`] and
//! [`LocalDatabase::delete_local`] are the entry points that respect them.

use crate::error::{SyncError, SyncResult};
use crate::local_db::{delete_row, record_from_row, upsert_row, LocalDatabase};
use crate::record::{Record, RecordKind, Uid};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteConnection;
use sqlx::{QueryBuilder, Row, Sqlite};
use std::collections::HashMap;

/// Sync status of a locally stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Synced => "synced",
            MutationState::PendingCreate => "pending_create",
            MutationState::PendingUpdate => "pending_update",
            MutationState::PendingDelete => "pending_delete",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "synced" => Ok(MutationState::Synced),
            "pending_create" => Ok(MutationState::PendingCreate),
            "pending_update" => Ok(MutationState::PendingUpdate),
            "pending_delete" => Ok(MutationState::PendingDelete),
            _ => Err(SyncError::InvalidOperation(format!("Unknown mutation state: {}", s))),
        }
    }

    /// Local edits that have not reached the server yet
    pub fn is_dirty(&self) -> bool {
        matches!(self, MutationState::PendingCreate | MutationState::PendingUpdate)
    }

    /// Any mutation still waiting to be pushed, deletions included
    pub fn is_pending(&self) -> bool {
        *self != MutationState::Synced
    }
}

/// Mutation states of one kind keyed by local identity
pub type StateSnapshot = HashMap<i64, MutationState>;

/// Whether the stored record behind `local_id` carries un-pushed edits
pub fn is_dirty(states: &StateSnapshot, local_id: Option<i64>) -> bool {
    local_id
        .and_then(|id| states.get(&id))
        .is_some_and(MutationState::is_dirty)
}

impl LocalDatabase {
    pub async fn state_of(
        &self,
        kind: &RecordKind,
        local_id: i64,
    ) -> SyncResult<Option<MutationState>> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT state FROM mutation_state WHERE kind = ? AND local_id = ?",
        )
        .bind(kind.as_str())
        .bind(local_id)
        .fetch_optional(self.pool())
        .await?;

        state.as_deref().map(MutationState::from_str).transpose()
    }

    /// State of whichever stored record carries `uid`, regardless of kind
    pub async fn state_of_uid(&self, uid: &Uid) -> SyncResult<Option<MutationState>> {
        let mut conn = self.pool().acquire().await?;
        state_of_uid_row(&mut *conn, uid).await
    }

    pub async fn set_state(
        &self,
        kind: &RecordKind,
        local_id: i64,
        state: MutationState,
    ) -> SyncResult<()> {
        let mut conn = self.pool().acquire().await?;
        set_state_row(&mut *conn, kind, local_id, state).await
    }

    pub async fn clear_state(&self, kind: &RecordKind, local_id: i64) -> SyncResult<()> {
        sqlx::query("DELETE FROM mutation_state WHERE kind = ? AND local_id = ?")
            .bind(kind.as_str())
            .bind(local_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Stored records of `kind` whose state is one of `states`.
    ///
    /// Records without a ledger entry count as [`MutationState::Synced`].
    pub async fn records_in_states(
        &self,
        kind: &RecordKind,
        states: &[MutationState],
    ) -> SyncResult<Vec<Record>> {
        if states.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT r.* FROM records r \
             LEFT JOIN mutation_state m ON m.kind = r.kind AND m.local_id = r.local_id \
             WHERE r.kind = ",
        );
        query.push_bind(kind.as_str());
        query.push(" AND COALESCE(m.state, 'synced') IN (");
        let mut separated = query.separated(", ");
        for state in states {
            separated.push_bind(state.as_str());
        }
        separated.push_unseparated(") ORDER BY r.local_id ASC");

        let rows = query.build().fetch_all(self.pool()).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Every ledger entry of one kind
    pub async fn states_for(&self, kind: &RecordKind) -> SyncResult<StateSnapshot> {
        let rows = sqlx::query("SELECT local_id, state FROM mutation_state WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_all(self.pool())
            .await?;

        let mut states = StateSnapshot::with_capacity(rows.len());
        for row in rows {
            let local_id: i64 = row.try_get("local_id")?;
            let state: String = row.try_get("state")?;
            states.insert(local_id, MutationState::from_str(&state)?);
        }
        Ok(states)
    }

    /// Store a locally edited record and mark it for push.
    ///
    /// New records become `PendingCreate`, synced ones `PendingUpdate`.
    /// A record awaiting deletion cannot be edited.
    pub async fn save_local(&self, record: &Record) -> SyncResult<Record> {
        let mut tx = self.pool().begin().await?;

        let existing: Option<(i64, Option<String>)> = sqlx::query_as(
            r#"
            SELECT r.local_id, m.state FROM records r
            LEFT JOIN mutation_state m ON m.kind = r.kind AND m.local_id = r.local_id
            WHERE r.uid = ?
            "#,
        )
        .bind(record.uid.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let current = match &existing {
            Some((_, state)) => state.as_deref().map(MutationState::from_str).transpose()?,
            None => None,
        };

        let next = match (existing.is_some(), current) {
            (_, Some(MutationState::PendingDelete)) => {
                return Err(SyncError::InvalidOperation(format!(
                    "{} {} is pending deletion",
                    record.kind, record.uid
                )));
            }
            (false, _) | (true, Some(MutationState::PendingCreate)) => MutationState::PendingCreate,
            (true, _) => MutationState::PendingUpdate,
        };

        let local_id = upsert_row(&mut *tx, record).await?;
        set_state_row(&mut *tx, &record.kind, local_id, next).await?;
        tx.commit().await?;

        tracing::debug!(
            kind = %record.kind,
            uid = %record.uid,
            local_id,
            state = next.as_str(),
            "Saved local record"
        );

        let mut stored = record.clone();
        stored.local_id = Some(local_id);
        stored.children = None;
        Ok(stored)
    }

    /// Remove a record locally.
    ///
    /// A record the server has never seen is deleted outright; anything
    /// else is marked `PendingDelete` until the deletion is pushed.
    /// Returns the resulting state, `None` when the row is gone.
    pub async fn delete_local(&self, uid: &Uid) -> SyncResult<Option<MutationState>> {
        let mut tx = self.pool().begin().await?;

        let existing: Option<(i64, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT r.local_id, r.kind, m.state FROM records r
            LEFT JOIN mutation_state m ON m.kind = r.kind AND m.local_id = r.local_id
            WHERE r.uid = ?
            "#,
        )
        .bind(uid.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let Some((local_id, kind, state)) = existing else {
            return Err(SyncError::NotFound(format!("record {}", uid)));
        };
        let kind = RecordKind::new(kind);
        let state = state.as_deref().map(MutationState::from_str).transpose()?;

        let outcome = match state {
            Some(MutationState::PendingCreate) => {
                delete_row(&mut *tx, &kind, local_id).await?;
                None
            }
            Some(MutationState::PendingDelete) => Some(MutationState::PendingDelete),
            _ => {
                set_state_row(&mut *tx, &kind, local_id, MutationState::PendingDelete).await?;
                Some(MutationState::PendingDelete)
            }
        };
        tx.commit().await?;

        tracing::debug!(kind = %kind, uid = %uid, local_id, "Deleted local record");

        Ok(outcome)
    }
}

/// Ledger state of the stored row carrying `uid`; `None` when there is no
/// such row or it has no ledger entry
pub(crate) async fn state_of_uid_row(
    conn: &mut SqliteConnection,
    uid: &Uid,
) -> SyncResult<Option<MutationState>> {
    let state: Option<Option<String>> = sqlx::query_scalar(
        r#"
        SELECT m.state FROM records r
        LEFT JOIN mutation_state m ON m.kind = r.kind AND m.local_id = r.local_id
        WHERE r.uid = ?
        "#,
    )
    .bind(uid.as_str())
    .fetch_optional(&mut *conn)
    .await?;

    state.flatten().as_deref().map(MutationState::from_str).transpose()
}

pub(crate) async fn set_state_row(
    conn: &mut SqliteConnection,
    kind: &RecordKind,
    local_id: i64,
    state: MutationState,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO mutation_state (kind, local_id, state, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(kind, local_id) DO UPDATE SET
            state = excluded.state,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(kind.as_str())
    .bind(local_id)
    .bind(state.as_str())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;
    Ok(())
}
