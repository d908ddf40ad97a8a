//! Per-resource sync watermarks
//!
//! A watermark is the server time at which the last complete inbound
//! cycle of a resource started. Scoped resources keep one watermark per
//! scope key; the unscoped watermark is stored under the empty scope.

use crate::error::SyncResult;
use crate::local_db::{parse_timestamp, LocalDatabase};
use crate::record::RecordKind;
use chrono::{DateTime, Utc};

impl LocalDatabase {
    pub async fn watermark(
        &self,
        resource: &RecordKind,
        scope: Option<&str>,
    ) -> SyncResult<Option<DateTime<Utc>>> {
        let synced_at: Option<String> = sqlx::query_scalar(
            "SELECT synced_at FROM sync_watermark WHERE resource = ? AND scope = ?",
        )
        .bind(resource.as_str())
        .bind(scope.unwrap_or_default())
        .fetch_optional(self.pool())
        .await?;

        synced_at.as_deref().map(parse_timestamp).transpose()
    }

    pub async fn set_watermark(
        &self,
        resource: &RecordKind,
        synced_at: DateTime<Utc>,
        scope: Option<&str>,
    ) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_watermark (resource, scope, synced_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(resource, scope) DO UPDATE SET
                synced_at = excluded.synced_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(resource.as_str())
        .bind(scope.unwrap_or_default())
        .bind(synced_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(self.pool())
        .await?;

        tracing::debug!(
            resource = %resource,
            scope = scope.unwrap_or_default(),
            synced_at = %synced_at,
            "Advanced sync watermark"
        );

        Ok(())
    }

    /// Forget a watermark so the next inbound cycle fetches everything
    pub async fn clear_watermark(
        &self,
        resource: &RecordKind,
        scope: Option<&str>,
    ) -> SyncResult<()> {
        sqlx::query("DELETE FROM sync_watermark WHERE resource = ? AND scope = ?")
            .bind(resource.as_str())
            .bind(scope.unwrap_or_default())
            .execute(self.pool())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::local_db::tests::{create_test_db, ts};
    use crate::record::RecordKind;

    #[tokio::test]
    async fn test_watermarks_are_scoped() {
        let (db, _dir) = create_test_db().await;
        let events = RecordKind::new("event");

        assert_eq!(db.watermark(&events, None).await.unwrap(), None);

        db.set_watermark(&events, ts(10), None).await.unwrap();
        db.set_watermark(&events, ts(20), Some("IpHINAT79UW")).await.unwrap();

        assert_eq!(db.watermark(&events, None).await.unwrap(), Some(ts(10)));
        assert_eq!(db.watermark(&events, Some("IpHINAT79UW")).await.unwrap(), Some(ts(20)));
        assert_eq!(db.watermark(&events, Some("eBAyeGv0exc")).await.unwrap(), None);
        assert_eq!(db.watermark(&RecordKind::new("program"), None).await.unwrap(), None);

        db.set_watermark(&events, ts(30), None).await.unwrap();
        assert_eq!(db.watermark(&events, None).await.unwrap(), Some(ts(30)));

        db.clear_watermark(&events, Some("IpHINAT79UW")).await.unwrap();
        assert_eq!(db.watermark(&events, Some("IpHINAT79UW")).await.unwrap(), None);
    }
}
