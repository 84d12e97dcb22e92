//! Storage watchers: discover source documents and hand them to the pipeline.
//!
//! Two backends are built in and selected by `pipeline.source_store`:
//!
//! | Name | Type | Discovery |
//! |------|------|-----------|
//! | `local` | [`LocalWatcher`] | polls each bundle's source directory |
//! | `google_drive` | [`DriveWatcher`] | push notifications through a webhook |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::{Config, Secrets};
use crate::google_drive::GoogleDriveClient;
use crate::models::{ByteStream, SourceDocument};
use crate::store::WatchChannelStore;
use crate::watch_channels::WatchChannelManager;
use crate::watcher_drive::DriveWatcher;
use crate::watcher_local::LocalWatcher;

/// A source of documents for the pipeline.
///
/// Emitted documents are not deduplicated; the pipeline's admission check
/// makes repeated emissions harmless.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Store name recorded on admitted documents (e.g. `"local"`).
    fn store_name(&self) -> &str;

    /// Starts discovery and returns the channel discovered documents arrive on.
    ///
    /// Call at most once.
    async fn start_watching(&self) -> Result<mpsc::Receiver<SourceDocument>>;

    /// Opens the original bytes of a discovered document.
    async fn open(&self, doc: &SourceDocument) -> Result<ByteStream>;

    /// Moves a processed document out of its watched folder.
    async fn archive(&self, doc: &SourceDocument) -> Result<()>;

    /// HTTP routes the watcher needs mounted (webhook endpoints).
    fn router(&self) -> Option<axum::Router> {
        None
    }

    /// Stops background discovery and waits for it to exit.
    async fn shutdown(&self) {}
}

/// Builds the watcher named by `pipeline.source_store`.
pub fn build_watcher(
    config: &Config,
    secrets: &Secrets,
    channels: Arc<dyn WatchChannelStore>,
) -> Result<Arc<dyn Watcher>> {
    match config.pipeline.source_store.as_str() {
        "local" => Ok(Arc::new(LocalWatcher::new(
            config.bundles.clone(),
            Duration::from_secs(config.local.poll_interval_secs),
        ))),
        "google_drive" => {
            let (Some(key_file), Some(webhook_url)) =
                (&secrets.google_service_key_file, &secrets.google_webhook_url)
            else {
                bail!("GOOGLE_SERVICE_KEY_FILE and GOOGLE_WEBHOOK_URL are required by the google_drive watcher");
            };
            let client = Arc::new(GoogleDriveClient::from_key_file(key_file, &config.drive.api_url)?);
            let manager = WatchChannelManager::new(
                client.clone(),
                channels,
                config.bundles.iter().map(|b| b.source_folder.clone()).collect(),
                webhook_url,
                secrets.webhook_channel_secret.clone(),
                Duration::from_secs(config.drive.channel_ttl_secs),
                Duration::from_secs(config.drive.expiry_margin_secs),
            )?;
            Ok(Arc::new(DriveWatcher::new(
                client,
                Arc::new(manager),
                config.bundles.clone(),
                Duration::from_secs(config.drive.renewal_interval_secs),
                config.drive.discovery_buffer,
            )))
        }
        other => bail!("Unknown source store: '{}'", other),
    }
}
