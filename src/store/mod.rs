//! Persistence abstraction for admission records and watch channels.
//!
//! The [`DocumentStore`] trait backs the pipeline's single-admission check
//! and per-stage progress markers; [`WatchChannelStore`] persists the
//! push-notification subscription for each watched folder.
//!
//! Implementations must be `Send + Sync` to be shared across tasks.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{DocumentRecord, WatchChannel};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Outcome of [`DocumentStore::create_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A new record was created; the document may enter the pipeline.
    Created(DocumentRecord),
    /// A record for this `(source_store, source_id)` already existed.
    AlreadyExists(DocumentRecord),
}

/// Admission records.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_document`](DocumentStore::create_document) | Atomically create the record unless one exists |
/// | [`update_status`](DocumentStore::update_status) | Stamp a progress string and time |
/// | [`find_by_source_id`](DocumentStore::find_by_source_id) | Look a record up by its source identity |
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Creates the record for `(source_store, source_id)` unless one exists.
    ///
    /// Concurrent calls for the same key yield exactly one `Created`.
    async fn create_document(
        &self,
        source_store: &str,
        source_id: &str,
        source_name: &str,
    ) -> Result<Admission>;

    /// Records a progress string. Fails if the record does not exist.
    async fn update_status(
        &self,
        record_id: &str,
        at: DateTime<Utc>,
        status: &str,
    ) -> Result<DocumentRecord>;

    async fn find_by_source_id(
        &self,
        source_store: &str,
        source_id: &str,
    ) -> Result<Option<DocumentRecord>>;
}

/// Watch-channel subscriptions, keyed by folder id.
#[async_trait]
pub trait WatchChannelStore: Send + Sync {
    async fn get_watch_channel(&self, folder_id: &str) -> Result<Option<WatchChannel>>;

    /// Inserts or replaces the channel for `channel.folder_id`.
    async fn upsert_watch_channel(&self, channel: &WatchChannel) -> Result<WatchChannel>;

    async fn list_watch_channels(&self) -> Result<Vec<WatchChannel>>;
}
