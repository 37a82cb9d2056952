//! Structured metadata store keyed by entry ID.

use crate::error::MemoryError;
use crate::persist::{read_json_or_default, write_json_atomic};
use crate::types::{EntryId, StoredRecord};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

pub const METADATA_FILE: &str = "metadata.json";

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a new record. Fails with [`MemoryError::AlreadyExists`] if the
    /// ID is taken; records are never overwritten.
    async fn insert(&self, record: StoredRecord) -> Result<(), MemoryError>;

    async fn remove(&self, id: &str) -> Result<Option<StoredRecord>, MemoryError>;

    async fn get(&self, id: &str) -> Result<Option<StoredRecord>, MemoryError>;

    async fn all(&self) -> Result<Vec<StoredRecord>, MemoryError>;
}

/// Metadata persisted as one JSON object of `id -> record`.
pub struct JsonMetadataStore {
    path: Option<PathBuf>,
    records: RwLock<BTreeMap<EntryId, StoredRecord>>,
}

impl JsonMetadataStore {
    pub async fn open(dir: &Path) -> Result<Self, MemoryError> {
        let path = dir.join(METADATA_FILE);
        let records: BTreeMap<EntryId, StoredRecord> = read_json_or_default(&path).await?;
        debug!(path = %path.display(), count = records.len(), "Loaded metadata");
        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    pub fn ephemeral() -> Self {
        Self {
            path: None,
            records: RwLock::new(BTreeMap::new()),
        }
    }

    async fn persist(&self, records: &BTreeMap<EntryId, StoredRecord>) -> Result<(), MemoryError> {
        match &self.path {
            Some(path) => write_json_atomic(path, records).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn insert(&self, record: StoredRecord) -> Result<(), MemoryError> {
        let mut records = self.records.write().await;
        let id = record.id().to_string();
        if records.contains_key(&id) {
            return Err(MemoryError::AlreadyExists(id));
        }
        records.insert(id.clone(), record);

        if let Err(e) = self.persist(&records).await {
            records.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<Option<StoredRecord>, MemoryError> {
        let mut records = self.records.write().await;
        let Some(removed) = records.remove(id) else {
            return Ok(None);
        };

        if let Err(e) = self.persist(&records).await {
            records.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(Some(removed))
    }

    async fn get(&self, id: &str) -> Result<Option<StoredRecord>, MemoryError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn all(&self) -> Result<Vec<StoredRecord>, MemoryError> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}
