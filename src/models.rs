//! Core data models used throughout Scriptoria.
//!
//! These types represent the documents discovered by a watcher, the unit of
//! work that flows through the stage chain, and the rows persisted for
//! admission tracking and push-notification subscriptions.

use chrono::{DateTime, Utc};
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::PipelineError;

/// Readable byte stream for the current representation of a document.
///
/// Dropping the stream closes it.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Wraps an in-memory buffer as a [`ByteStream`].
pub fn stream_from_bytes(bytes: impl Into<Vec<u8>>) -> ByteStream {
    Box::new(Cursor::new(bytes.into()))
}

/// Reads a stream to the end, surfacing any read failure.
pub async fn read_stream(mut stream: ByteStream) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    Ok(buf)
}

/// Item discovered at the watcher boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    /// Identifier unique within the source store.
    pub source_id: String,
    /// Display name, including the extension.
    pub name: String,
    /// Identifier of the folder the document was found in.
    pub folder_id: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl SourceDocument {
    /// Name without its extension (`scan.pdf` → `scan`).
    pub fn stem(&self) -> &str {
        match self.name.rfind('.') {
            Some(idx) if idx > 0 => &self.name[..idx],
            _ => &self.name,
        }
    }
}

/// Unit of work flowing through the stage chain.
///
/// Exactly one task owns a context at a time. Once `error` is set no stage
/// performs work on it; it drains to the collector unprocessed.
pub struct TransformContext {
    pub source: Arc<SourceDocument>,
    /// Persisted record id assigned at admission.
    pub record_id: String,
    pub stream: Option<ByteStream>,
    pub error: Option<PipelineError>,
}

impl TransformContext {
    pub fn new(source: Arc<SourceDocument>, record_id: String, stream: ByteStream) -> Self {
        Self {
            source,
            record_id,
            stream: Some(stream),
            error: None,
        }
    }

    /// Drops the current stream and records the failure.
    pub fn fail(&mut self, error: PipelineError) {
        self.stream = None;
        self.error = Some(error);
    }
}

impl fmt::Debug for TransformContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformContext")
            .field("source_id", &self.source.source_id)
            .field("record_id", &self.record_id)
            .field("has_stream", &self.stream.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Persisted admission row, one per `(source_store, source_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub source_store: String,
    pub source_id: String,
    pub source_name: String,
    pub processed_at: Option<DateTime<Utc>>,
    pub processing_status: Option<String>,
}

/// Persisted push-notification subscription for one watched folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchChannel {
    pub folder_id: String,
    pub channel_id: String,
    /// Provider-assigned id of the watched resource, known once subscribed.
    pub resource_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub webhook_url: String,
}
