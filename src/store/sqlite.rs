//! SQLite-backed [`DocumentStore`] and [`WatchChannelStore`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::{DocumentRecord, WatchChannel};

use super::{Admission, DocumentStore, WatchChannelStore};

const DOCUMENT_COLUMNS: &str = "id, created_at, updated_at, source_store, source_id, source_name, processed_at, processing_status";
const CHANNEL_COLUMNS: &str = "folder_id, channel_id, resource_id, expires_at, webhook_url";

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn document_from_row(row: &SqliteRow) -> DocumentRecord {
    let processed_at: Option<i64> = row.get("processed_at");
    DocumentRecord {
        id: row.get("id"),
        created_at: ts(row.get("created_at")),
        updated_at: ts(row.get("updated_at")),
        source_store: row.get("source_store"),
        source_id: row.get("source_id"),
        source_name: row.get("source_name"),
        processed_at: processed_at.map(ts),
        processing_status: row.get("processing_status"),
    }
}

fn channel_from_row(row: &SqliteRow) -> WatchChannel {
    let expires_ms: i64 = row.get("expires_at");
    WatchChannel {
        folder_id: row.get("folder_id"),
        channel_id: row.get("channel_id"),
        resource_id: row.get("resource_id"),
        expires_at: DateTime::from_timestamp_millis(expires_ms).unwrap_or_default(),
        webhook_url: row.get("webhook_url"),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create_document(
        &self,
        source_store: &str,
        source_id: &str,
        source_name: &str,
    ) -> Result<Admission> {
        let now = Utc::now().timestamp();

        // The unique key makes the insert the admission check itself.
        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO documents (id, created_at, updated_at, source_store, source_id, source_name)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_store, source_id) DO NOTHING
            RETURNING {}
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(now)
        .bind(now)
        .bind(source_store)
        .bind(source_id)
        .bind(source_name)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(Admission::Created(document_from_row(&row)));
        }

        match self.find_by_source_id(source_store, source_id).await? {
            Some(existing) => Ok(Admission::AlreadyExists(existing)),
            None => bail!(
                "document {}:{} conflicted on insert but could not be read back",
                source_store,
                source_id
            ),
        }
    }

    async fn update_status(
        &self,
        record_id: &str,
        at: DateTime<Utc>,
        status: &str,
    ) -> Result<DocumentRecord> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE documents
            SET processed_at = ?, processing_status = ?, updated_at = ?
            WHERE id = ?
            RETURNING {}
            "#,
            DOCUMENT_COLUMNS
        ))
        .bind(at.timestamp())
        .bind(status)
        .bind(Utc::now().timestamp())
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(document_from_row(&row)),
            None => bail!("document record not found: {}", record_id),
        }
    }

    async fn find_by_source_id(
        &self,
        source_store: &str,
        source_id: &str,
    ) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE source_store = ? AND source_id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(source_store)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(document_from_row))
    }
}

#[async_trait]
impl WatchChannelStore for SqliteStore {
    async fn get_watch_channel(&self, folder_id: &str) -> Result<Option<WatchChannel>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM watch_channels WHERE folder_id = ?",
            CHANNEL_COLUMNS
        ))
        .bind(folder_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(channel_from_row))
    }

    async fn upsert_watch_channel(&self, channel: &WatchChannel) -> Result<WatchChannel> {
        let now = Utc::now().timestamp();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO watch_channels (folder_id, channel_id, resource_id, expires_at, webhook_url, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(folder_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                resource_id = excluded.resource_id,
                expires_at = excluded.expires_at,
                webhook_url = excluded.webhook_url,
                updated_at = excluded.updated_at
            RETURNING {}
            "#,
            CHANNEL_COLUMNS
        ))
        .bind(&channel.folder_id)
        .bind(&channel.channel_id)
        .bind(&channel.resource_id)
        .bind(channel.expires_at.timestamp_millis())
        .bind(&channel.webhook_url)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(channel_from_row(&row))
    }

    async fn list_watch_channels(&self) -> Result<Vec<WatchChannel>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM watch_channels ORDER BY folder_id ASC",
            CHANNEL_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(channel_from_row).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_store() -> SqliteStore {
        // A single connection keeps the in-memory database alive and shared.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let store = memory_store().await;
        let first = store.create_document("local", "a", "a.pdf").await.unwrap();
        let second = store.create_document("local", "a", "a.pdf").await.unwrap();

        let created = match first {
            Admission::Created(r) => r,
            other => panic!("expected Created, got {other:?}"),
        };
        match second {
            Admission::AlreadyExists(r) => assert_eq!(r.id, created.id),
            other => panic!("expected AlreadyExists, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_same_id_in_other_store_is_distinct() {
        let store = memory_store().await;
        store.create_document("local", "a", "a.pdf").await.unwrap();
        let other = store.create_document("google_drive", "a", "a.pdf").await.unwrap();
        assert!(matches!(other, Admission::Created(_)));
    }

    #[tokio::test]
    async fn test_update_status() {
        let store = memory_store().await;
        let record = match store.create_document("local", "a", "a.pdf").await.unwrap() {
            Admission::Created(r) => r,
            other => panic!("{other:?}"),
        };
        assert!(record.processing_status.is_none());

        let updated = store
            .update_status(&record.id, Utc::now(), "ocr: started")
            .await
            .unwrap();
        assert_eq!(updated.processing_status.as_deref(), Some("ocr: started"));
        assert!(updated.processed_at.is_some());

        assert!(store
            .update_status("missing", Utc::now(), "x")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_watch_channel_upsert_replaces() {
        let store = memory_store().await;
        assert!(store.get_watch_channel("folder").await.unwrap().is_none());

        let expires = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let mut channel = WatchChannel {
            folder_id: "folder".into(),
            channel_id: "c1".into(),
            resource_id: None,
            expires_at: expires,
            webhook_url: "https://example.com/hook".into(),
        };
        store.upsert_watch_channel(&channel).await.unwrap();

        channel.channel_id = "c2".into();
        channel.resource_id = Some("r2".into());
        let saved = store.upsert_watch_channel(&channel).await.unwrap();
        assert_eq!(saved, channel);

        let all = store.list_watch_channels().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].channel_id, "c2");
        assert_eq!(all[0].expires_at, expires);
    }
}
