//! Watch-channel lifecycle and webhook tests against stub Drive and
//! notification-provider implementations.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use scriptoria::config::StorageBundle;
use scriptoria::google_drive::{DriveApi, DriveFile};
use scriptoria::models::{stream_from_bytes, ByteStream, SourceDocument, WatchChannel};
use scriptoria::store::{InMemoryStore, WatchChannelStore};
use scriptoria::watch_channels::{
    ChannelProvider, ChannelRequest, ChannelState, Notification, NotificationAction,
    WatchChannelManager,
};
use scriptoria::watcher::Watcher;
use scriptoria::watcher_drive::DriveWatcher;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const WEBHOOK_URL: &str = "https://hooks.example.com/webhooks/drive";
const TTL: Duration = Duration::from_secs(24 * 3600);
const MARGIN: Duration = Duration::from_secs(300);

// ─── Stubs ──────────────────────────────────────────────────────────

#[derive(Default)]
struct StubProvider {
    watched: Mutex<Vec<ChannelRequest>>,
    stopped: Mutex<Vec<String>>,
    failing_folders: Mutex<HashSet<String>>,
}

impl StubProvider {
    fn watched(&self) -> Vec<ChannelRequest> {
        self.watched.lock().unwrap().clone()
    }

    fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    fn request_for(&self, channel_id: &str) -> ChannelRequest {
        self.watched()
            .into_iter()
            .find(|r| r.channel_id == channel_id)
            .expect("no watch request for channel")
    }
}

#[async_trait]
impl ChannelProvider for StubProvider {
    async fn watch(&self, req: &ChannelRequest) -> Result<Option<String>> {
        if self.failing_folders.lock().unwrap().contains(&req.folder_id) {
            return Err(anyhow!("backend error"));
        }
        self.watched.lock().unwrap().push(req.clone());
        Ok(Some(format!("res-{}", req.folder_id)))
    }

    async fn stop(&self, channel_id: &str, _resource_id: Option<&str>) -> Result<()> {
        self.stopped.lock().unwrap().push(channel_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct StubDrive {
    files: Vec<DriveFile>,
    list_calls: AtomicUsize,
    moved: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl DriveApi for StubDrive {
    async fn list_pdfs(&self, _folder_ids: &[String]) -> Result<Vec<DriveFile>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.files.clone())
    }

    async fn download(&self, file_id: &str) -> Result<ByteStream> {
        Ok(stream_from_bytes(format!("%PDF {}", file_id)))
    }

    async fn move_file(&self, file_id: &str, folder_id: &str) -> Result<()> {
        self.moved
            .lock()
            .unwrap()
            .push((file_id.to_string(), folder_id.to_string()));
        Ok(())
    }
}

/// Channel store whose writes always fail.
struct BrokenStore;

#[async_trait]
impl WatchChannelStore for BrokenStore {
    async fn get_watch_channel(&self, _folder_id: &str) -> Result<Option<WatchChannel>> {
        Ok(None)
    }

    async fn upsert_watch_channel(&self, _channel: &WatchChannel) -> Result<WatchChannel> {
        Err(anyhow!("database is locked"))
    }

    async fn list_watch_channels(&self) -> Result<Vec<WatchChannel>> {
        Ok(Vec::new())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn new_manager(
    provider: Arc<StubProvider>,
    store: Arc<InMemoryStore>,
    folders: &[&str],
    url: &str,
    secret: Option<&str>,
) -> WatchChannelManager {
    WatchChannelManager::new(
        provider,
        store,
        folders.iter().map(|f| f.to_string()).collect(),
        url,
        secret.map(str::to_string),
        TTL,
        MARGIN,
    )
    .unwrap()
}

fn channel_for(manager: &WatchChannelManager, folder: &str) -> WatchChannel {
    manager
        .active_channels()
        .into_iter()
        .find(|c| c.folder_id == folder)
        .expect("folder has no active channel")
}

fn bundle(source: &str, archive: &str) -> StorageBundle {
    StorageBundle {
        source_folder: source.to_string(),
        archive_folder: archive.to_string(),
        dest_attachments_folder: PathBuf::from("/tmp/attachments"),
        dest_notes_folder: PathBuf::from("/tmp/notes"),
    }
}

async fn recv_doc(rx: &mut mpsc::Receiver<SourceDocument>) -> SourceDocument {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a document")
        .expect("document channel closed")
}

// ─── Renewal ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_first_renewal_subscribes_every_folder() {
    let provider = Arc::new(StubProvider::default());
    let store = Arc::new(InMemoryStore::new());
    let manager = new_manager(provider.clone(), store.clone(), &["a", "b"], WEBHOOK_URL, None);

    assert_eq!(manager.state_of("a", Utc::now()), ChannelState::Absent);
    let before = Utc::now();
    assert_eq!(manager.renew().await, 2);

    let persisted = store.list_watch_channels().await.unwrap();
    assert_eq!(persisted.len(), 2);
    for channel in &persisted {
        assert_eq!(channel.webhook_url, WEBHOOK_URL);
        assert_eq!(
            channel.resource_id.as_deref(),
            Some(format!("res-{}", channel.folder_id).as_str())
        );
        assert!(channel.expires_at >= before + chrono::Duration::hours(23));
        assert!(manager.is_active(&channel.channel_id));
    }
    assert_eq!(manager.state_of("a", Utc::now()), ChannelState::Active);
    assert!(provider.stopped().is_empty());
}

#[tokio::test]
async fn test_active_channels_are_left_alone() {
    let provider = Arc::new(StubProvider::default());
    let store = Arc::new(InMemoryStore::new());
    let manager = new_manager(provider.clone(), store, &["a"], WEBHOOK_URL, None);

    assert_eq!(manager.renew().await, 1);
    let id = channel_for(&manager, "a").channel_id;

    assert_eq!(manager.renew().await, 0);
    assert_eq!(channel_for(&manager, "a").channel_id, id);
    assert_eq!(provider.watched().len(), 1);
}

#[tokio::test]
async fn test_persisted_channel_survives_restart() {
    let provider = Arc::new(StubProvider::default());
    let store = Arc::new(InMemoryStore::new());

    let first = new_manager(provider.clone(), store.clone(), &["a"], WEBHOOK_URL, None);
    first.renew().await;
    let id = channel_for(&first, "a").channel_id;

    let second = new_manager(provider.clone(), store, &["a"], WEBHOOK_URL, None);
    assert_eq!(second.renew().await, 0);
    assert_eq!(channel_for(&second, "a").channel_id, id);
    assert_eq!(provider.watched().len(), 1);
}

#[tokio::test]
async fn test_expiring_channel_is_replaced_and_old_becomes_orphan() {
    let provider = Arc::new(StubProvider::default());
    let store = Arc::new(InMemoryStore::new());
    let expiring = WatchChannel {
        folder_id: "a".to_string(),
        channel_id: "old-channel".to_string(),
        resource_id: Some("res-a".to_string()),
        expires_at: Utc::now() + chrono::Duration::seconds(30),
        webhook_url: WEBHOOK_URL.to_string(),
    };
    store.upsert_watch_channel(&expiring).await.unwrap();

    let manager = new_manager(provider.clone(), store.clone(), &["a"], WEBHOOK_URL, None);
    assert_eq!(manager.renew().await, 1);

    let renewed = channel_for(&manager, "a");
    assert_ne!(renewed.channel_id, "old-channel");
    assert!(renewed.expires_at > expiring.expires_at);
    assert!(!manager.is_active("old-channel"));
    assert_eq!(
        store.get_watch_channel("a").await.unwrap().unwrap().channel_id,
        renewed.channel_id
    );
    assert_eq!(provider.stopped(), vec!["old-channel".to_string()]);

    // A late notification on the replaced channel is only stopped.
    let action = manager
        .handle_notification(&Notification {
            channel_id: "old-channel".to_string(),
            resource_state: "update".to_string(),
            ..Notification::default()
        })
        .await;
    assert_eq!(action, NotificationAction::Orphaned);
    assert_eq!(provider.stopped().len(), 2);
}

#[tokio::test]
async fn test_changed_webhook_url_resubscribes() {
    let provider = Arc::new(StubProvider::default());
    let store = Arc::new(InMemoryStore::new());
    let moved = WatchChannel {
        folder_id: "a".to_string(),
        channel_id: "moved".to_string(),
        resource_id: None,
        expires_at: Utc::now() + chrono::Duration::hours(20),
        webhook_url: "https://old.example.com/webhooks/drive".to_string(),
    };
    store.upsert_watch_channel(&moved).await.unwrap();

    let manager = new_manager(provider.clone(), store, &["a"], WEBHOOK_URL, None);
    assert_eq!(manager.renew().await, 1);
    assert_eq!(channel_for(&manager, "a").webhook_url, WEBHOOK_URL);
    assert_eq!(provider.stopped(), vec!["moved".to_string()]);
}

#[tokio::test]
async fn test_failed_folder_is_retried_next_pass() {
    let provider = Arc::new(StubProvider::default());
    provider
        .failing_folders
        .lock()
        .unwrap()
        .insert("a".to_string());
    let store = Arc::new(InMemoryStore::new());
    let manager = new_manager(provider.clone(), store, &["a", "b"], WEBHOOK_URL, None);

    assert_eq!(manager.renew().await, 1);
    assert_eq!(manager.state_of("a", Utc::now()), ChannelState::Absent);
    assert_eq!(manager.state_of("b", Utc::now()), ChannelState::Active);

    provider.failing_folders.lock().unwrap().clear();
    assert_eq!(manager.renew().await, 1);
    assert_eq!(manager.state_of("a", Utc::now()), ChannelState::Active);
}

#[tokio::test]
async fn test_unrecorded_subscription_is_stopped() {
    let provider = Arc::new(StubProvider::default());
    let manager = WatchChannelManager::new(
        provider.clone(),
        Arc::new(BrokenStore),
        vec!["a".to_string()],
        WEBHOOK_URL,
        None,
        TTL,
        MARGIN,
    )
    .unwrap();

    assert_eq!(manager.renew().await, 0);
    assert_eq!(manager.state_of("a", Utc::now()), ChannelState::Absent);

    let watched = provider.watched();
    assert_eq!(watched.len(), 1);
    assert_eq!(provider.stopped(), vec![watched[0].channel_id.clone()]);
    assert!(!manager.is_active(&watched[0].channel_id));
}

#[test]
fn test_invalid_webhook_url_is_rejected() {
    let result = WatchChannelManager::new(
        Arc::new(StubProvider::default()),
        Arc::new(InMemoryStore::new()),
        vec!["a".to_string()],
        "not a url",
        None,
        TTL,
        MARGIN,
    );
    assert!(result.is_err());
}

// ─── Notifications ──────────────────────────────────────────────────

#[tokio::test]
async fn test_notification_actions() {
    let provider = Arc::new(StubProvider::default());
    let store = Arc::new(InMemoryStore::new());
    let manager = new_manager(provider.clone(), store, &["a"], WEBHOOK_URL, Some("s3cret"));
    manager.renew().await;

    let channel = channel_for(&manager, "a");
    let token = provider.request_for(&channel.channel_id).token;
    assert!(token.is_some(), "channel registered without a token");

    let notify = |state: &str, token: Option<String>| Notification {
        channel_id: channel.channel_id.clone(),
        resource_id: channel.resource_id.clone(),
        resource_state: state.to_string(),
        token,
    };

    assert_eq!(
        manager.handle_notification(&notify("sync", token.clone())).await,
        NotificationAction::Ignored
    );
    for state in ["add", "update", "change", "trash"] {
        assert_eq!(
            manager.handle_notification(&notify(state, token.clone())).await,
            NotificationAction::Discover,
            "state {}",
            state
        );
    }
    assert_eq!(
        manager
            .handle_notification(&notify("update", Some("deadbeef".to_string())))
            .await,
        NotificationAction::Rejected
    );
    assert_eq!(
        manager.handle_notification(&notify("update", None)).await,
        NotificationAction::Rejected
    );
    assert!(provider.stopped().is_empty());
}

// ─── Webhook over HTTP ──────────────────────────────────────────────

/// Prove that the Drive watcher's webhook route drives discovery, ignores
/// sync events, stops orphans and rejects forged tokens.
#[tokio::test]
async fn test_webhook_route_end_to_end() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = format!("http://127.0.0.1:{}/webhooks/drive", port);

    let provider = Arc::new(StubProvider::default());
    let store = Arc::new(InMemoryStore::new());
    let manager = Arc::new(new_manager(
        provider.clone(),
        store,
        &["inbox"],
        &url,
        Some("s3cret"),
    ));
    let drive = Arc::new(StubDrive {
        files: vec![DriveFile {
            id: "file-1".to_string(),
            name: "scan.pdf".to_string(),
            parents: vec!["inbox".to_string()],
            created_time: None,
            modified_time: None,
        }],
        ..StubDrive::default()
    });
    let watcher = DriveWatcher::new(
        drive.clone(),
        manager.clone(),
        vec![bundle("inbox", "archive")],
        Duration::from_secs(3600),
        4,
    );

    let router = watcher.router().expect("drive watcher exposes a webhook");
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let mut rx = watcher.start_watching().await.unwrap();
    assert!(watcher.start_watching().await.is_err());

    // Initial discovery.
    let doc = recv_doc(&mut rx).await;
    assert_eq!(doc.source_id, "file-1");
    assert_eq!(doc.folder_id, "inbox");
    assert_eq!(drive.list_calls.load(Ordering::SeqCst), 1);

    let channel = channel_for(&manager, "inbox");
    let token = provider.request_for(&channel.channel_id).token.unwrap();
    let client = reqwest::Client::new();
    let post = |channel_id: &str, state: &str, token: &str| {
        client
            .post(&url)
            .header("x-goog-channel-id", channel_id)
            .header("x-goog-resource-id", "res-inbox")
            .header("x-goog-resource-state", state)
            .header("x-goog-channel-token", token)
            .send()
    };

    let resp = post(&channel.channel_id, "update", &token).await.unwrap();
    assert_eq!(resp.status(), 200);
    let again = recv_doc(&mut rx).await;
    assert_eq!(again.source_id, "file-1");
    assert_eq!(drive.list_calls.load(Ordering::SeqCst), 2);

    let resp = post(&channel.channel_id, "sync", &token).await.unwrap();
    assert_eq!(resp.status(), 200);

    let resp = post(&channel.channel_id, "update", "forged").await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = post("stranger", "update", "").await.unwrap();
    // The token check comes first, so an unknown channel without a valid
    // token is rejected rather than stopped.
    assert_eq!(resp.status(), 401);
    assert!(provider.stopped().is_empty());

    // Neither sync nor rejected notifications trigger discovery.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), rx.recv())
            .await
            .is_err()
    );
    assert_eq!(drive.list_calls.load(Ordering::SeqCst), 2);

    watcher.archive(&doc).await.unwrap();
    assert_eq!(
        drive.moved.lock().unwrap().clone(),
        vec![("file-1".to_string(), "archive".to_string())]
    );

    watcher.shutdown().await;
    server.abort();
}

/// Prove that a signed notification for an unknown channel is stopped and
/// never triggers discovery.
#[tokio::test]
async fn test_webhook_stops_orphaned_channel() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let url = format!("http://127.0.0.1:{}/webhooks/drive", port);

    let provider = Arc::new(StubProvider::default());
    let manager = Arc::new(new_manager(
        provider.clone(),
        Arc::new(InMemoryStore::new()),
        &["inbox"],
        &url,
        None,
    ));
    let drive = Arc::new(StubDrive::default());
    let watcher = DriveWatcher::new(
        drive.clone(),
        manager,
        vec![bundle("inbox", "archive")],
        Duration::from_secs(3600),
        4,
    );
    let router = watcher.router().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    let _rx = watcher.start_watching().await.unwrap();

    // Let the initial discovery pass finish.
    tokio::time::timeout(Duration::from_secs(5), async {
        while drive.list_calls.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let resp = reqwest::Client::new()
        .post(&url)
        .header("x-goog-channel-id", "stranger")
        .header("x-goog-resource-state", "update")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(provider.stopped(), vec!["stranger".to_string()]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(drive.list_calls.load(Ordering::SeqCst), 1);

    watcher.shutdown().await;
    server.abort();
}
