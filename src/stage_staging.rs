//! `staging` stage: spools the original document to the staging folder.
//!
//! The staged copy is what the `bundle` stage later files as the note's
//! attachment. Each document gets its own subfolder keyed by its source id,
//! so documents sharing a name never overwrite each other's copy.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::models::{ByteStream, SourceDocument};
use crate::stage::Stage;

pub struct StagingStage {
    folder: PathBuf,
}

impl StagingStage {
    pub fn new(folder: PathBuf) -> Self {
        Self { folder }
    }
}

/// Location of a document's staged copy: `<folder>/<key>/<file name>`,
/// where `key` is derived from the source id.
///
/// Only the final path component of the document name is used.
pub fn staged_path(folder: &Path, doc: &SourceDocument) -> PathBuf {
    let name = Path::new(&doc.name)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| doc.source_id.clone().into());
    folder.join(staging_key(&doc.source_id)).join(name)
}

fn staging_key(source_id: &str) -> String {
    let digest = Sha256::digest(source_id.as_bytes());
    hex::encode(&digest[..8])
}

#[async_trait]
impl Stage for StagingStage {
    fn name(&self) -> &str {
        "staging"
    }

    async fn initialize(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.folder)
            .await
            .with_context(|| format!("Failed to create staging folder: {}", self.folder.display()))
    }

    async fn process(&self, doc: &SourceDocument, mut input: ByteStream) -> Result<ByteStream> {
        let path = staged_path(&self.folder, doc);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        tokio::io::copy(&mut input, &mut file)
            .await
            .with_context(|| format!("Failed to stage {}", path.display()))?;
        file.flush().await?;
        drop(file);

        let staged = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("Failed to reopen {}", path.display()))?;
        Ok(Box::new(staged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{read_stream, stream_from_bytes};
    use chrono::Utc;
    use tempfile::TempDir;

    fn doc(name: &str) -> SourceDocument {
        doc_with_id("id-1", name)
    }

    fn doc_with_id(source_id: &str, name: &str) -> SourceDocument {
        SourceDocument {
            source_id: source_id.into(),
            name: name.into(),
            folder_id: "inbox".into(),
            created_at: Utc::now(),
            modified_at: Utc::now(),
        }
    }

    #[test]
    fn test_staged_path_ignores_directories() {
        let folder = Path::new("/tmp/staging");
        let key = staging_key("id-1");
        assert_eq!(
            staged_path(folder, &doc("../../etc/scan.pdf")),
            folder.join(&key).join("scan.pdf")
        );
        assert_eq!(
            staged_path(folder, &doc("..")),
            folder.join(&key).join("id-1")
        );
    }

    #[test]
    fn test_same_name_different_source_is_distinct() {
        let folder = Path::new("/tmp/staging");
        let a = staged_path(folder, &doc_with_id("drive-a", "scan.pdf"));
        let b = staged_path(folder, &doc_with_id("drive-b", "scan.pdf"));
        assert_ne!(a, b);
        assert_eq!(a.file_name(), b.file_name());
    }

    #[tokio::test]
    async fn test_stages_and_passes_bytes_on() {
        let tmp = TempDir::new().unwrap();
        let stage = StagingStage::new(tmp.path().join("staging"));
        stage.initialize().await.unwrap();

        let out = stage
            .process(&doc("scan.pdf"), stream_from_bytes("%PDF-1.4"))
            .await
            .unwrap();
        assert_eq!(read_stream(out).await.unwrap(), b"%PDF-1.4");

        let on_disk = std::fs::read(staged_path(&tmp.path().join("staging"), &doc("scan.pdf")))
            .unwrap();
        assert_eq!(on_disk, b"%PDF-1.4");
    }

    #[tokio::test]
    async fn test_same_named_documents_keep_their_own_bytes() {
        let tmp = TempDir::new().unwrap();
        let folder = tmp.path().join("staging");
        let stage = StagingStage::new(folder.clone());
        stage.initialize().await.unwrap();

        let first = doc_with_id("drive-a", "scan.pdf");
        let second = doc_with_id("drive-b", "scan.pdf");
        let (a, b) = tokio::join!(
            stage.process(&first, stream_from_bytes("first")),
            stage.process(&second, stream_from_bytes("second")),
        );
        assert_eq!(read_stream(a.unwrap()).await.unwrap(), b"first");
        assert_eq!(read_stream(b.unwrap()).await.unwrap(), b"second");

        assert_eq!(std::fs::read(staged_path(&folder, &first)).unwrap(), b"first");
        assert_eq!(std::fs::read(staged_path(&folder, &second)).unwrap(), b"second");
    }
}
