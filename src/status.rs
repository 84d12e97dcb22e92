//! `status` and `channels` commands: read-only views of persisted state.

use anyhow::{bail, Result};
use chrono::Utc;

use crate::config::Config;
use crate::db;
use crate::models::DocumentRecord;
use crate::store::{DocumentStore, SqliteStore, WatchChannelStore};
use crate::watch_channels::channel_state;

/// Looks a document record up by its source id.
///
/// `store` defaults to the configured `pipeline.source_store`.
pub async fn find_record(
    config: &Config,
    source_id: &str,
    store: Option<&str>,
) -> Result<Option<DocumentRecord>> {
    let pool = db::connect(config).await?;
    let records = SqliteStore::new(pool.clone());
    let store = store.unwrap_or(&config.pipeline.source_store);
    let record = records.find_by_source_id(store, source_id).await;
    pool.close().await;
    record
}

pub async fn run_status(config: &Config, source_id: &str, store: Option<&str>) -> Result<()> {
    let Some(record) = find_record(config, source_id, store).await? else {
        bail!("document not found: {}", source_id);
    };

    println!("--- Document ---");
    println!("id:           {}", record.id);
    println!("name:         {}", record.source_name);
    println!("store:        {}", record.source_store);
    println!("source_id:    {}", record.source_id);
    println!("created_at:   {}", record.created_at.to_rfc3339());
    println!("updated_at:   {}", record.updated_at.to_rfc3339());
    println!(
        "processed_at: {}",
        record
            .processed_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    );
    println!(
        "status:       {}",
        record.processing_status.as_deref().unwrap_or("(pending)")
    );
    Ok(())
}

/// Lists persisted watch channels with their state.
///
/// Channels are compared against `GOOGLE_WEBHOOK_URL` when it is set,
/// otherwise only their expiry is considered.
pub async fn run_channels(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let channels = SqliteStore::new(pool.clone()).list_watch_channels().await;
    pool.close().await;
    let channels = channels?;

    if channels.is_empty() {
        println!("No watch channels.");
        return Ok(());
    }

    let webhook_url = std::env::var("GOOGLE_WEBHOOK_URL").ok();
    let margin = chrono::Duration::seconds(config.drive.expiry_margin_secs as i64);
    let now = Utc::now();

    println!(
        "{:<36} {:<36} {:<7} {}",
        "FOLDER", "CHANNEL", "STATE", "EXPIRES"
    );
    for channel in &channels {
        let url = webhook_url.as_deref().unwrap_or(&channel.webhook_url);
        let state = channel_state(Some(channel), url, now, margin);
        println!(
            "{:<36} {:<36} {:<7} {}",
            channel.folder_id,
            channel.channel_id,
            state.to_string(),
            channel.expires_at.to_rfc3339()
        );
    }
    Ok(())
}
