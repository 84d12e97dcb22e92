//! `bundle` stage: files the finished note and its original attachment.
//!
//! The bundle is chosen by the document's origin folder. The note is written
//! to `<dest_notes_folder>/<stem>.md`; the staged original is copied to
//! `<dest_attachments_folder>/<name>` and the staged copy, with its per-document
//! staging subfolder, removed.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{find_bundle, StorageBundle};
use crate::error::PipelineError;
use crate::models::{read_stream, stream_from_bytes, ByteStream, SourceDocument};
use crate::stage::Stage;
use crate::stage_staging::staged_path;

pub struct BundleStage {
    bundles: Vec<StorageBundle>,
    staging_folder: PathBuf,
}

impl BundleStage {
    pub fn new(bundles: Vec<StorageBundle>, staging_folder: PathBuf) -> Self {
        Self {
            bundles,
            staging_folder,
        }
    }

    async fn file_attachment(&self, bundle: &StorageBundle, doc: &SourceDocument) -> Result<()> {
        let staged = staged_path(&self.staging_folder, doc);
        if !tokio::fs::try_exists(&staged).await.unwrap_or(false) {
            warn!(path = %staged.display(), "no staged original, skipping attachment");
            return Ok(());
        }

        let file_name = staged.file_name().map(PathBuf::from).unwrap_or_default();
        let dest = bundle.dest_attachments_folder.join(file_name);
        tokio::fs::copy(&staged, &dest).await.with_context(|| {
            format!("Failed to copy {} to {}", staged.display(), dest.display())
        })?;
        tokio::fs::remove_file(&staged)
            .await
            .with_context(|| format!("Failed to remove staged copy {}", staged.display()))?;
        if let Some(dir) = staged.parent() {
            if let Err(e) = tokio::fs::remove_dir(dir).await {
                debug!(path = %dir.display(), error = %e, "staging subfolder left in place");
            }
        }
        debug!(path = %dest.display(), "attachment filed");
        Ok(())
    }
}

#[async_trait]
impl Stage for BundleStage {
    fn name(&self) -> &str {
        "bundle"
    }

    async fn initialize(&self) -> Result<()> {
        for bundle in &self.bundles {
            for dir in [&bundle.dest_notes_folder, &bundle.dest_attachments_folder] {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create folder: {}", dir.display()))?;
            }
        }
        Ok(())
    }

    async fn process(&self, doc: &SourceDocument, input: ByteStream) -> Result<ByteStream> {
        let bundle = find_bundle(&self.bundles, &doc.folder_id).ok_or_else(|| {
            PipelineError::BundleNotFound {
                folder_id: doc.folder_id.clone(),
            }
        })?;

        let note = read_stream(input)
            .await
            .context("Failed to read note contents")?;

        let note_path = bundle.dest_notes_folder.join(format!("{}.md", doc.stem()));
        tokio::fs::write(&note_path, &note)
            .await
            .with_context(|| format!("Failed to write note {}", note_path.display()))?;
        debug!(path = %note_path.display(), "note written");

        self.file_attachment(bundle, doc).await?;

        Ok(stream_from_bytes(note))
    }
}
