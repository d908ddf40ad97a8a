//! Failure ledger
//!
//! Keeps the outcome of the last failed push per (record kind, local
//! identity). An entry is replaced on every new failure and removed by the
//! next successful push of the same record.

use crate::error::{FailureClass, SyncResult};
use crate::local_db::{parse_timestamp, LocalDatabase};
use crate::record::RecordKind;
use crate::remote::ImportConflict;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::Row;

/// What went wrong with one push attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushFailure {
    pub class: FailureClass,
    /// HTTP status, `None` when no response came back
    pub status_code: Option<u16>,
    pub message: String,
    pub conflicts: Vec<ImportConflict>,
}

impl PushFailure {
    pub fn new(class: FailureClass, status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            class,
            status_code,
            message: message.into(),
            conflicts: Vec::new(),
        }
    }
}

/// Stored failure of a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub kind: RecordKind,
    pub local_id: i64,
    pub class: FailureClass,
    pub status_code: Option<u16>,
    pub message: String,
    pub conflicts: Vec<ImportConflict>,
    /// Consecutive failed attempts
    pub attempts: i64,
    pub recorded_at: DateTime<Utc>,
}

impl LocalDatabase {
    /// Upsert the failure entry of a record
    pub async fn record_failure(
        &self,
        kind: &RecordKind,
        local_id: i64,
        failure: &PushFailure,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO failure_log (
                kind, local_id, class, status_code, message, conflicts, attempts, recorded_at
            ) VALUES (?, ?, ?, ?, ?, ?, 1, ?)
            ON CONFLICT(kind, local_id) DO UPDATE SET
                class = excluded.class,
                status_code = excluded.status_code,
                message = excluded.message,
                conflicts = excluded.conflicts,
                attempts = failure_log.attempts + 1,
                recorded_at = excluded.recorded_at
            "#,
        )
        .bind(kind.as_str())
        .bind(local_id)
        .bind(failure.class.as_str())
        .bind(failure.status_code.map(i64::from))
        .bind(&failure.message)
        .bind(serde_json::to_string(&failure.conflicts)?)
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        tracing::debug!(
            kind = %kind,
            local_id,
            class = failure.class.as_str(),
            status_code = ?failure.status_code,
            "Recorded push failure"
        );

        Ok(())
    }

    pub async fn clear_failure(&self, kind: &RecordKind, local_id: i64) -> SyncResult<()> {
        let mut conn = self.pool().acquire().await?;
        clear_failure_row(&mut *conn, kind, local_id).await
    }

    pub async fn find_failure(
        &self,
        kind: &RecordKind,
        local_id: i64,
    ) -> SyncResult<Option<FailureEntry>> {
        let row = sqlx::query("SELECT * FROM failure_log WHERE kind = ? AND local_id = ?")
            .bind(kind.as_str())
            .bind(local_id)
            .fetch_optional(self.pool())
            .await?;
        row.as_ref().map(failure_from_row).transpose()
    }

    /// All failure entries of one kind, for hosts surfacing sync errors
    pub async fn failures(&self, kind: &RecordKind) -> SyncResult<Vec<FailureEntry>> {
        let rows = sqlx::query("SELECT * FROM failure_log WHERE kind = ? ORDER BY local_id ASC")
            .bind(kind.as_str())
            .fetch_all(self.pool())
            .await?;
        rows.iter().map(failure_from_row).collect()
    }
}

pub(crate) async fn clear_failure_row(
    conn: &mut SqliteConnection,
    kind: &RecordKind,
    local_id: i64,
) -> SyncResult<()> {
    sqlx::query("DELETE FROM failure_log WHERE kind = ? AND local_id = ?")
        .bind(kind.as_str())
        .bind(local_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn failure_from_row(row: &SqliteRow) -> SyncResult<FailureEntry> {
    let kind: String = row.try_get("kind")?;
    let class: String = row.try_get("class")?;
    let status_code: Option<i64> = row.try_get("status_code")?;
    let conflicts: String = row.try_get("conflicts")?;
    let recorded_at: String = row.try_get("recorded_at")?;

    Ok(FailureEntry {
        kind: RecordKind::new(kind),
        local_id: row.try_get("local_id")?,
        class: FailureClass::from_str(&class)?,
        status_code: status_code.and_then(|code| u16::try_from(code).ok()),
        message: row.try_get("message")?,
        conflicts: serde_json::from_str(&conflicts)?,
        attempts: row.try_get("attempts")?,
        recorded_at: parse_timestamp(&recorded_at)?,
    })
}
