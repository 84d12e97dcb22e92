//! Google Drive watcher: push notifications plus scheduled channel renewal.
//!
//! `start_watching` subscribes every bundle folder, starts the renewal
//! ticker and runs one discovery pass. Afterwards, discovery runs whenever a
//! notification for an active channel arrives on the webhook route.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use crate::config::{find_bundle, StorageBundle};
use crate::google_drive::{DriveApi, DriveFile};
use crate::models::{ByteStream, SourceDocument};
use crate::watch_channels::{Notification, NotificationAction, WatchChannelManager};
use crate::watcher::Watcher;

const STORE_NAME: &str = "google_drive";

struct Shared {
    drive: Arc<dyn DriveApi>,
    manager: Arc<WatchChannelManager>,
    documents: Mutex<Option<mpsc::Sender<SourceDocument>>>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

pub struct DriveWatcher {
    shared: Arc<Shared>,
    bundles: Vec<StorageBundle>,
    renewal_interval: Duration,
    buffer: usize,
}

impl DriveWatcher {
    pub fn new(
        drive: Arc<dyn DriveApi>,
        manager: Arc<WatchChannelManager>,
        bundles: Vec<StorageBundle>,
        renewal_interval: Duration,
        buffer: usize,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                drive,
                manager,
                documents: Mutex::new(None),
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
            }),
            bundles,
            renewal_interval,
            buffer: buffer.max(1),
        }
    }

    pub fn manager(&self) -> &Arc<WatchChannelManager> {
        &self.shared.manager
    }
}

impl Shared {
    fn sender(&self) -> Option<mpsc::Sender<SourceDocument>> {
        self.documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn to_document(&self, file: DriveFile) -> SourceDocument {
        let folders = self.manager.folders();
        let folder_id = file
            .parents
            .iter()
            .find(|p| folders.contains(p))
            .or_else(|| file.parents.first())
            .cloned()
            .unwrap_or_default();
        let now = Utc::now();
        SourceDocument {
            source_id: file.id,
            name: file.name,
            folder_id,
            created_at: file.created_time.unwrap_or(now),
            modified_at: file.modified_time.unwrap_or(now),
        }
    }

    /// Lists PDFs in every watched folder and emits them, without dedup.
    async fn discover(&self) {
        let Some(tx) = self.sender() else {
            debug!("discovery requested before watching started");
            return;
        };
        let files = match self.drive.list_pdfs(self.manager.folders()).await {
            Ok(files) => files,
            Err(e) => {
                error!("file discovery failed: {:#}", e);
                return;
            }
        };
        debug!(count = files.len(), "discovered files");

        for file in files {
            let doc = self.to_document(file);
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                sent = tx.send(doc) => {
                    if sent.is_err() {
                        debug!("document receiver closed");
                        return;
                    }
                }
            }
        }
    }

    fn spawn_discovery(self: &Arc<Self>, renew_first: bool) {
        if self.cancel.is_cancelled() {
            return;
        }
        let shared = self.clone();
        self.tracker.spawn(async move {
            if renew_first {
                shared.manager.renew().await;
            }
            shared.discover().await;
        });
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `POST <webhook path>`: answers immediately; discovery runs in the background.
async fn notification(State(shared): State<Arc<Shared>>, headers: HeaderMap) -> StatusCode {
    let n = Notification {
        channel_id: header(&headers, "x-goog-channel-id").unwrap_or_default(),
        resource_id: header(&headers, "x-goog-resource-id"),
        resource_state: header(&headers, "x-goog-resource-state").unwrap_or_default(),
        token: header(&headers, "x-goog-channel-token"),
    };
    debug!(
        channel_id = %n.channel_id,
        resource_state = %n.resource_state,
        "push notification received"
    );

    match shared.manager.handle_notification(&n).await {
        NotificationAction::Rejected => StatusCode::UNAUTHORIZED,
        NotificationAction::Orphaned => StatusCode::OK,
        NotificationAction::Ignored => {
            let manager = shared.manager.clone();
            if !shared.cancel.is_cancelled() {
                shared.tracker.spawn(async move {
                    manager.renew().await;
                });
            }
            StatusCode::OK
        }
        NotificationAction::Discover => {
            shared.spawn_discovery(true);
            StatusCode::OK
        }
    }
}

#[async_trait]
impl Watcher for DriveWatcher {
    fn store_name(&self) -> &str {
        STORE_NAME
    }

    async fn start_watching(&self) -> Result<mpsc::Receiver<SourceDocument>> {
        let (tx, rx) = mpsc::channel(self.buffer);
        {
            let mut documents = self
                .shared
                .documents
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if documents.is_some() {
                return Err(anyhow!("drive watcher already started"));
            }
            *documents = Some(tx);
        }

        let created = self.shared.manager.renew().await;
        info!(
            folders = self.shared.manager.folders().len(),
            created, "watch channels ready"
        );

        let shared = self.shared.clone();
        let interval = self.renewal_interval;
        self.shared.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let renewed = shared.manager.renew().await;
                        debug!(renewed, "scheduled channel renewal");
                    }
                }
            }
        });

        self.shared.spawn_discovery(false);
        Ok(rx)
    }

    async fn open(&self, doc: &SourceDocument) -> Result<ByteStream> {
        self.shared
            .drive
            .download(&doc.source_id)
            .await
            .with_context(|| format!("Failed to download '{}'", doc.name))
    }

    async fn archive(&self, doc: &SourceDocument) -> Result<()> {
        let bundle = find_bundle(&self.bundles, &doc.folder_id).ok_or_else(|| {
            anyhow!(
                "no archive folder for '{}' in folder '{}'",
                doc.name,
                doc.folder_id
            )
        })?;
        self.shared
            .drive
            .move_file(&doc.source_id, &bundle.archive_folder)
            .await
            .with_context(|| format!("Failed to archive '{}'", doc.name))
    }

    fn router(&self) -> Option<Router> {
        let path = self.shared.manager.webhook_path().to_string();
        Some(
            Router::new()
                .route(&path, post(notification))
                .with_state(self.shared.clone()),
        )
    }

    async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.tracker.close();
        self.shared.tracker.wait().await;
        self.shared
            .documents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        debug!("drive watcher stopped");
    }
}
