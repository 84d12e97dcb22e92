//! In-memory store for tests and dry runs.
//!
//! Records live in `RwLock<HashMap>` maps; nothing survives the process.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{DocumentRecord, WatchChannel};

use super::{Admission, DocumentStore, WatchChannelStore};

#[derive(Default)]
pub struct InMemoryStore {
    /// Keyed by `(source_store, source_id)`.
    documents: RwLock<HashMap<(String, String), DocumentRecord>>,
    channels: RwLock<HashMap<String, WatchChannel>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All document records, oldest first.
    pub fn documents(&self) -> Vec<DocumentRecord> {
        let docs = self.documents.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = docs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        all
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create_document(
        &self,
        source_store: &str,
        source_id: &str,
        source_name: &str,
    ) -> Result<Admission> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let key = (source_store.to_string(), source_id.to_string());
        if let Some(existing) = docs.get(&key) {
            return Ok(Admission::AlreadyExists(existing.clone()));
        }

        let now = Utc::now();
        let record = DocumentRecord {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            source_store: source_store.to_string(),
            source_id: source_id.to_string(),
            source_name: source_name.to_string(),
            processed_at: None,
            processing_status: None,
        };
        docs.insert(key, record.clone());
        Ok(Admission::Created(record))
    }

    async fn update_status(
        &self,
        record_id: &str,
        at: DateTime<Utc>,
        status: &str,
    ) -> Result<DocumentRecord> {
        let mut docs = self.documents.write().map_err(poisoned)?;
        let Some(record) = docs.values_mut().find(|r| r.id == record_id) else {
            bail!("document record not found: {}", record_id);
        };
        record.processed_at = Some(at);
        record.processing_status = Some(status.to_string());
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn find_by_source_id(
        &self,
        source_store: &str,
        source_id: &str,
    ) -> Result<Option<DocumentRecord>> {
        let docs = self.documents.read().map_err(poisoned)?;
        Ok(docs
            .get(&(source_store.to_string(), source_id.to_string()))
            .cloned())
    }
}

#[async_trait]
impl WatchChannelStore for InMemoryStore {
    async fn get_watch_channel(&self, folder_id: &str) -> Result<Option<WatchChannel>> {
        let channels = self.channels.read().map_err(poisoned)?;
        Ok(channels.get(folder_id).cloned())
    }

    async fn upsert_watch_channel(&self, channel: &WatchChannel) -> Result<WatchChannel> {
        let mut channels = self.channels.write().map_err(poisoned)?;
        channels.insert(channel.folder_id.clone(), channel.clone());
        Ok(channel.clone())
    }

    async fn list_watch_channels(&self) -> Result<Vec<WatchChannel>> {
        let channels = self.channels.read().map_err(poisoned)?;
        let mut all: Vec<_> = channels.values().cloned().collect();
        all.sort_by(|a, b| a.folder_id.cmp(&b.folder_id));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admission_once() {
        let store = InMemoryStore::new();
        let a = store.create_document("local", "x", "x.pdf").await.unwrap();
        let b = store.create_document("local", "x", "x.pdf").await.unwrap();
        assert!(matches!(a, Admission::Created(_)));
        assert!(matches!(b, Admission::AlreadyExists(_)));
        assert_eq!(store.documents().len(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_record_fails() {
        let store = InMemoryStore::new();
        assert!(store.update_status("nope", Utc::now(), "x").await.is_err());
    }
}
