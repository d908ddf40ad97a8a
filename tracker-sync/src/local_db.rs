//! Local SQLite database for offline-first operations
//!
//! Provides:
//! - Persistence of synchronized records of every kind
//! - Mutation state ledger (see [`crate::state`])
//! - Failure ledger (see [`crate::failure`])
//! - Per-resource sync watermarks (see [`crate::watermark`])
//!
//! Row-level helpers take a `&mut SqliteConnection` so the same code runs
//! against a pooled connection or inside the transaction of the batch
//! executor.

use crate::error::{SyncError, SyncResult};
use crate::failure::clear_failure_row;
use crate::record::{Record, RecordKind, Uid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{QueryBuilder, Row, Sqlite};

/// Configuration for local database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDbConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
    /// Whether to enforce foreign keys on every connection
    pub enable_foreign_keys: bool,
}

impl Default for LocalDbConfig {
    fn default() -> Self {
        Self {
            db_path: "tracker_sync.db".to_string(),
            max_connections: 5,
            enable_wal: true,
            enable_foreign_keys: true,
        }
    }
}

/// Local database handle
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open (creating if needed) the local database
    pub async fn new(config: LocalDbConfig) -> SyncResult<Self> {
        let journal_mode = if config.enable_wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true)
            .journal_mode(journal_mode)
            .foreign_keys(config.enable_foreign_keys);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.initialize_schema().await?;

        tracing::debug!(db_path = %config.db_path, "Opened local database");

        Ok(db)
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                local_id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                uid TEXT NOT NULL UNIQUE,
                parent_uid TEXT,
                scope TEXT,
                created TEXT,
                last_modified TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_scope ON records(kind, scope)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_parent ON records(parent_uid)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mutation_state (
                kind TEXT NOT NULL,
                local_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (kind, local_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failure_log (
                kind TEXT NOT NULL,
                local_id INTEGER NOT NULL,
                class TEXT NOT NULL,
                status_code INTEGER,
                message TEXT NOT NULL,
                conflicts TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 1,
                recorded_at TEXT NOT NULL,
                PRIMARY KEY (kind, local_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_watermark (
                resource TEXT NOT NULL,
                scope TEXT NOT NULL DEFAULT '',
                synced_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (resource, scope)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a new record, returning it with its local identity
    pub async fn insert(&self, record: &Record) -> SyncResult<Record> {
        let mut conn = self.pool.acquire().await?;
        let local_id = insert_row(&mut *conn, record).await?;
        Ok(with_identity(record, local_id))
    }

    /// Update a stored record addressed by its local identity
    pub async fn update(&self, record: &Record) -> SyncResult<()> {
        let local_id = require_local_id(record)?;
        let mut conn = self.pool.acquire().await?;
        if update_row(&mut *conn, local_id, record).await? == 0 {
            return Err(SyncError::NotFound(format!("record {}", local_id)));
        }
        Ok(())
    }

    /// Insert or update a record, matched by UID
    pub async fn save(&self, record: &Record) -> SyncResult<Record> {
        let mut conn = self.pool.acquire().await?;
        let local_id = upsert_row(&mut *conn, record).await?;
        Ok(with_identity(record, local_id))
    }

    /// Delete a record together with its ledger and failure entries
    pub async fn delete(&self, record: &Record) -> SyncResult<bool> {
        let local_id = require_local_id(record)?;
        let mut tx = self.pool.begin().await?;
        let removed = delete_row(&mut *tx, &record.kind, local_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    pub async fn query_by_id(&self, local_id: i64) -> SyncResult<Option<Record>> {
        let row = sqlx::query("SELECT * FROM records WHERE local_id = ?")
            .bind(local_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn query_by_uid(&self, uid: &Uid) -> SyncResult<Option<Record>> {
        let row = sqlx::query("SELECT * FROM records WHERE uid = ?")
            .bind(uid.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// All stored records of a kind, in insertion order
    pub async fn query_all(&self, kind: &RecordKind) -> SyncResult<Vec<Record>> {
        let rows = sqlx::query("SELECT * FROM records WHERE kind = ? ORDER BY local_id ASC")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Stored records of a kind synchronized under one scope key
    pub async fn query_scope(&self, kind: &RecordKind, scope: &str) -> SyncResult<Vec<Record>> {
        let rows = sqlx::query(
            "SELECT * FROM records WHERE kind = ? AND scope = ? ORDER BY local_id ASC",
        )
        .bind(kind.as_str())
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Direct children of `parent` restricted to the given kinds
    pub async fn query_children(
        &self,
        parent: &Uid,
        kinds: &[RecordKind],
    ) -> SyncResult<Vec<Record>> {
        if kinds.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new("SELECT * FROM records WHERE parent_uid = ");
        query.push_bind(parent.as_str());
        query.push(" AND kind IN (");
        let mut separated = query.separated(", ");
        for kind in kinds {
            separated.push_bind(kind.as_str());
        }
        separated.push_unseparated(") ORDER BY local_id ASC");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connection
    pub async fn close(self) -> SyncResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

pub(crate) fn require_local_id(record: &Record) -> SyncResult<i64> {
    record.local_id.ok_or_else(|| {
        SyncError::InvalidOperation(format!(
            "{} {} has no local identity",
            record.kind, record.uid
        ))
    })
}

fn with_identity(record: &Record, local_id: i64) -> Record {
    let mut stored = record.clone();
    stored.local_id = Some(local_id);
    stored.children = None;
    stored
}

pub(crate) async fn insert_row(conn: &mut SqliteConnection, record: &Record) -> SyncResult<i64> {
    let result = sqlx::query(
        r#"
        INSERT INTO records (kind, uid, parent_uid, scope, created, last_modified, payload)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.kind.as_str())
    .bind(record.uid.as_str())
    .bind(record.parent.as_ref().map(Uid::as_str))
    .bind(record.scope.as_deref())
    .bind(record.created.map(|t| t.to_rfc3339()))
    .bind(record.last_modified.to_rfc3339())
    .bind(record.payload.to_string())
    .execute(&mut *conn)
    .await?;

    Ok(result.last_insert_rowid())
}

pub(crate) async fn update_row(
    conn: &mut SqliteConnection,
    local_id: i64,
    record: &Record,
) -> SyncResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE records
        SET kind = ?, uid = ?, parent_uid = ?, scope = ?, created = ?,
            last_modified = ?, payload = ?
        WHERE local_id = ?
        "#,
    )
    .bind(record.kind.as_str())
    .bind(record.uid.as_str())
    .bind(record.parent.as_ref().map(Uid::as_str))
    .bind(record.scope.as_deref())
    .bind(record.created.map(|t| t.to_rfc3339()))
    .bind(record.last_modified.to_rfc3339())
    .bind(record.payload.to_string())
    .bind(local_id)
    .execute(&mut *conn)
    .await?;

    Ok(result.rows_affected())
}

/// Insert or update by UID, returning the local identity of the row
pub(crate) async fn upsert_row(conn: &mut SqliteConnection, record: &Record) -> SyncResult<i64> {
    let existing: Option<i64> = sqlx::query_scalar("SELECT local_id FROM records WHERE uid = ?")
        .bind(record.uid.as_str())
        .fetch_optional(&mut *conn)
        .await?;

    match existing {
        Some(local_id) => {
            update_row(conn, local_id, record).await?;
            Ok(local_id)
        }
        None => insert_row(conn, record).await,
    }
}

pub(crate) async fn delete_row(
    conn: &mut SqliteConnection,
    kind: &RecordKind,
    local_id: i64,
) -> SyncResult<bool> {
    let result = sqlx::query("DELETE FROM records WHERE local_id = ?")
        .bind(local_id)
        .execute(&mut *conn)
        .await?;

    sqlx::query("DELETE FROM mutation_state WHERE kind = ? AND local_id = ?")
        .bind(kind.as_str())
        .bind(local_id)
        .execute(&mut *conn)
        .await?;

    clear_failure_row(&mut *conn, kind, local_id).await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) fn record_from_row(row: &SqliteRow) -> SyncResult<Record> {
    let local_id: i64 = row.try_get("local_id")?;
    let kind: String = row.try_get("kind")?;
    let uid: String = row.try_get("uid")?;
    let parent_uid: Option<String> = row.try_get("parent_uid")?;
    let scope: Option<String> = row.try_get("scope")?;
    let created: Option<String> = row.try_get("created")?;
    let last_modified: String = row.try_get("last_modified")?;
    let payload: String = row.try_get("payload")?;

    Ok(Record {
        local_id: Some(local_id),
        uid: Uid::new(uid),
        kind: RecordKind::new(kind),
        created: created.as_deref().map(parse_timestamp).transpose()?,
        last_modified: parse_timestamp(&last_modified)?,
        parent: parent_uid.map(Uid::new),
        scope,
        payload: serde_json::from_str(&payload)?,
        children: None,
    })
}

pub(crate) fn parse_timestamp(value: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("Invalid timestamp: {}", e)))
}
