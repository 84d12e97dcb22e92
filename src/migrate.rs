use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index on an open pool. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per admitted source document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            source_store TEXT NOT NULL,
            source_id TEXT NOT NULL,
            source_name TEXT NOT NULL,
            processed_at INTEGER,
            processing_status TEXT,
            UNIQUE(source_store, source_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // One push-notification channel per watched folder
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS watch_channels (
            folder_id TEXT PRIMARY KEY,
            channel_id TEXT NOT NULL,
            resource_id TEXT,
            expires_at INTEGER NOT NULL,
            webhook_url TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_documents_source_id ON documents(source_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_watch_channels_channel_id ON watch_channels(channel_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
