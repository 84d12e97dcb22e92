//! Local polling watcher.
//!
//! Each bundle's `source_folder` is a directory. Every poll emits the PDFs
//! found directly inside it; processed files are moved to the bundle's
//! `archive_folder`. A document's source id is `<absolute path>@<mtime>`,
//! so a file replaced in place is admitted again.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobMatcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{find_bundle, StorageBundle};
use crate::models::{ByteStream, SourceDocument};
use crate::watcher::Watcher;

const STORE_NAME: &str = "local";

pub struct LocalWatcher {
    bundles: Vec<StorageBundle>,
    poll_interval: Duration,
    tracker: TaskTracker,
    cancel: CancellationToken,
    started: Mutex<bool>,
}

impl LocalWatcher {
    pub fn new(bundles: Vec<StorageBundle>, poll_interval: Duration) -> Self {
        Self {
            bundles,
            poll_interval,
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            started: Mutex::new(false),
        }
    }
}

fn pdf_matcher() -> Result<GlobMatcher> {
    Ok(GlobBuilder::new("*.pdf")
        .case_insensitive(true)
        .build()?
        .compile_matcher())
}

fn to_utc(time: std::io::Result<SystemTime>) -> DateTime<Utc> {
    time.map(DateTime::<Utc>::from).unwrap_or_default()
}

/// Lists the PDFs directly inside `folder`, sorted by name.
pub fn scan_folder(folder: &str, matcher: &GlobMatcher) -> Result<Vec<SourceDocument>> {
    let root = Path::new(folder);
    if !root.is_dir() {
        return Err(anyhow!("watched folder does not exist: {}", root.display()));
    }

    let mut docs = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).max_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() || !matcher.is_match(entry.file_name()) {
            continue;
        }

        let path = entry.path();
        let metadata = entry.metadata()?;
        let modified = to_utc(metadata.modified());
        let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        docs.push(SourceDocument {
            source_id: format!("{}@{}", absolute.display(), modified.timestamp()),
            name: entry.file_name().to_string_lossy().to_string(),
            folder_id: folder.to_string(),
            created_at: to_utc(metadata.created()),
            modified_at: modified,
        });
    }

    docs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(docs)
}

fn document_path(doc: &SourceDocument) -> PathBuf {
    Path::new(&doc.folder_id).join(&doc.name)
}

/// Moves `from` to `to`, copying across filesystems when rename fails.
async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    tokio::fs::remove_file(from)
        .await
        .with_context(|| format!("Failed to remove {}", from.display()))?;
    Ok(())
}

#[async_trait]
impl Watcher for LocalWatcher {
    fn store_name(&self) -> &str {
        STORE_NAME
    }

    async fn start_watching(&self) -> Result<mpsc::Receiver<SourceDocument>> {
        {
            let mut started = self.started.lock().unwrap_or_else(|e| e.into_inner());
            if *started {
                return Err(anyhow!("local watcher already started"));
            }
            *started = true;
        }

        let matcher = pdf_matcher()?;
        let folders: Vec<String> = self.bundles.iter().map(|b| b.source_folder.clone()).collect();
        let (tx, rx) = mpsc::channel(16);
        let cancel = self.cancel.clone();
        let period = self.poll_interval;

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                for folder in &folders {
                    let (f, m) = (folder.clone(), matcher.clone());
                    let docs = match tokio::task::spawn_blocking(move || scan_folder(&f, &m)).await {
                        Ok(Ok(docs)) => docs,
                        Ok(Err(e)) => {
                            warn!(folder_id = %folder, "scan failed: {:#}", e);
                            continue;
                        }
                        Err(e) => {
                            warn!(folder_id = %folder, "scan task failed: {}", e);
                            continue;
                        }
                    };

                    for doc in docs {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            sent = tx.send(doc) => {
                                if sent.is_err() {
                                    debug!("document receiver closed");
                                    return;
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn open(&self, doc: &SourceDocument) -> Result<ByteStream> {
        let path = document_path(doc);
        let file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(Box::new(file))
    }

    async fn archive(&self, doc: &SourceDocument) -> Result<()> {
        let bundle = find_bundle(&self.bundles, &doc.folder_id)
            .ok_or_else(|| anyhow!("no archive folder for folder '{}'", doc.folder_id))?;
        let archive = Path::new(&bundle.archive_folder);
        tokio::fs::create_dir_all(archive)
            .await
            .with_context(|| format!("Failed to create archive folder {}", archive.display()))?;

        move_file(&document_path(doc), &archive.join(&doc.name)).await?;
        debug!(name = %doc.name, "archived");
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn bundle(root: &Path) -> StorageBundle {
        StorageBundle {
            source_folder: root.join("inbox").to_string_lossy().to_string(),
            archive_folder: root.join("archive").to_string_lossy().to_string(),
            dest_attachments_folder: root.join("attachments"),
            dest_notes_folder: root.join("notes"),
        }
    }

    #[test]
    fn test_scan_only_pdfs_at_top_level() {
        let tmp = TempDir::new().unwrap();
        let inbox = tmp.path().join("inbox");
        std::fs::create_dir_all(inbox.join("nested")).unwrap();
        std::fs::write(inbox.join("a.pdf"), b"%PDF").unwrap();
        std::fs::write(inbox.join("B.PDF"), b"%PDF").unwrap();
        std::fs::write(inbox.join("notes.txt"), b"x").unwrap();
        std::fs::write(inbox.join("nested/c.pdf"), b"%PDF").unwrap();

        let folder = inbox.to_string_lossy().to_string();
        let docs = scan_folder(&folder, &pdf_matcher().unwrap()).unwrap();
        let names: Vec<_> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["B.PDF", "a.pdf"]);
        assert!(docs.iter().all(|d| d.folder_id == folder));
        assert!(docs[1].source_id.contains("a.pdf@"));
    }

    #[test]
    fn test_scan_missing_folder_fails() {
        let matcher = pdf_matcher().unwrap();
        assert!(scan_folder("/nonexistent/scriptoria-inbox", &matcher).is_err());
    }

    #[tokio::test]
    async fn test_watch_open_and_archive() {
        let tmp = TempDir::new().unwrap();
        let b = bundle(tmp.path());
        std::fs::create_dir_all(&b.source_folder).unwrap();
        std::fs::write(Path::new(&b.source_folder).join("scan.pdf"), b"%PDF").unwrap();

        let watcher = LocalWatcher::new(vec![b.clone()], Duration::from_millis(20));
        let mut rx = watcher.start_watching().await.unwrap();
        let doc = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.name, "scan.pdf");

        let bytes = crate::models::read_stream(watcher.open(&doc).await.unwrap())
            .await
            .unwrap();
        assert_eq!(bytes, b"%PDF");

        watcher.archive(&doc).await.unwrap();
        assert!(Path::new(&b.archive_folder).join("scan.pdf").exists());
        assert!(!Path::new(&b.source_folder).join("scan.pdf").exists());

        watcher.shutdown().await;
        assert!(watcher.start_watching().await.is_err());
    }
}
