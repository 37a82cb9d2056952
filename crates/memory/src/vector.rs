//! Vector similarity store.

use crate::error::MemoryError;
use crate::persist::{read_json_or_default, write_json_atomic};
use crate::types::{Collection, EntryId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, instrument};

pub const VECTORS_FILE: &str = "vectors.json";

/// Cosine distance `1 - cos(a, b)`, clamped to `[0, 2]`.
///
/// A zero vector is at distance 1 from everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }

    (1.0 - dot / (norm_a * norm_b)).clamp(0.0, 2.0)
}

/// Addressable store of embeddings keyed by entry ID.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(
        &self,
        collection: Collection,
        id: &str,
        vector: Vec<f32>,
    ) -> Result<(), MemoryError>;

    /// Returns whether a vector was removed.
    async fn delete(&self, id: &str) -> Result<bool, MemoryError>;

    /// Nearest `top_k` vectors in `collection`, ascending by distance.
    async fn search(
        &self,
        collection: Collection,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(EntryId, f32)>, MemoryError>;

    async fn ids(&self) -> Result<Vec<EntryId>, MemoryError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VectorRecord {
    collection: Collection,
    vector: Vec<f32>,
}

/// Brute-force vector store persisted as one JSON snapshot.
///
/// Without a path it is purely in-memory.
pub struct FileVectorStore {
    path: Option<PathBuf>,
    records: RwLock<HashMap<EntryId, VectorRecord>>,
}

impl FileVectorStore {
    pub async fn open(dir: &Path) -> Result<Self, MemoryError> {
        let path = dir.join(VECTORS_FILE);
        let records: HashMap<EntryId, VectorRecord> = read_json_or_default(&path).await?;
        debug!(path = %path.display(), count = records.len(), "Loaded vectors");
        Ok(Self {
            path: Some(path),
            records: RwLock::new(records),
        })
    }

    pub fn ephemeral() -> Self {
        Self {
            path: None,
            records: RwLock::new(HashMap::new()),
        }
    }

    async fn persist(&self, records: &HashMap<EntryId, VectorRecord>) -> Result<(), MemoryError> {
        match &self.path {
            Some(path) => write_json_atomic(path, records).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl VectorStore for FileVectorStore {
    async fn upsert(
        &self,
        collection: Collection,
        id: &str,
        vector: Vec<f32>,
    ) -> Result<(), MemoryError> {
        let mut records = self.records.write().await;
        let previous = records.insert(id.to_string(), VectorRecord { collection, vector });

        if let Err(e) = self.persist(&records).await {
            match previous {
                Some(prev) => records.insert(id.to_string(), prev),
                None => records.remove(id),
            };
            return Err(e);
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        let mut records = self.records.write().await;
        let Some(removed) = records.remove(id) else {
            return Ok(false);
        };

        if let Err(e) = self.persist(&records).await {
            records.insert(id.to_string(), removed);
            return Err(e);
        }
        Ok(true)
    }

    #[instrument(skip(self, query), fields(dim = query.len()))]
    async fn search(
        &self,
        collection: Collection,
        query: &[f32],
        top_k: usize,
    ) -> Result<Vec<(EntryId, f32)>, MemoryError> {
        let records = self.records.read().await;
        let mut scored: Vec<(EntryId, f32)> = records
            .iter()
            .filter(|(_, r)| r.collection == collection && r.vector.len() == query.len())
            .map(|(id, r)| (id.clone(), cosine_distance(query, &r.vector)))
            .collect();

        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn ids(&self) -> Result<Vec<EntryId>, MemoryError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }
}
