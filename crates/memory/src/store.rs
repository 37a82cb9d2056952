//! The memory subsystem: paired vector and metadata stores behind one handle.

use crate::cache::{CacheKey, QueryCache};
use crate::embedding::{build_embedder, Embedder};
use crate::error::MemoryError;
use crate::metadata::{JsonMetadataStore, MetadataStore};
use crate::topics::{extract_keywords, infer_topics};
use crate::types::{
    Collection, ConversationRecord, EntryId, KnowledgeEntry, MemoryConfig, MemoryHit,
    MemoryQuery, MemoryStats, StoredRecord,
};
use crate::vector::{FileVectorStore, VectorStore};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// Extra candidates fetched beyond `top_k` on the first search pass. The
/// window doubles while the `top_k`-th result still ties the farthest one.
const TIE_SLACK: usize = 8;

/// Which path answered a [`MemorySubsystem::lookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum LookupSource {
    Cache,
    Vector,
    KeywordFallback { reason: String },
    Unavailable { reason: String },
}

#[derive(Debug, Clone)]
pub struct MemoryLookup {
    /// Ascending by distance for cache/vector results
    pub hits: Vec<MemoryHit>,
    pub source: LookupSource,
}

/// Outcome of the startup consistency pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub orphan_vectors_removed: usize,
    pub reembedded: usize,
    pub dropped: usize,
}

/// Vector store + metadata store + query cache.
///
/// Every record lives in both stores under the same ID. [`store`](Self::store)
/// is the only mutation path, and it serializes writers per ID.
pub struct MemorySubsystem {
    config: MemoryConfig,
    embedder: Arc<dyn Embedder>,
    vectors: Arc<dyn VectorStore>,
    metadata: Arc<dyn MetadataStore>,
    cache: QueryCache,
    superseded: RwLock<HashSet<EntryId>>,
    write_locks: DashMap<EntryId, Arc<Mutex<()>>>,
    persistent: bool,
}

impl MemorySubsystem {
    /// Open (or create) the file-backed stores under `config.storage_path`
    /// and restore the vector/metadata pairing.
    pub async fn open(config: MemoryConfig) -> Result<Self, MemoryError> {
        info!(
            storage_path = %config.storage_path.display(),
            embedding_model = %config.embedding_model,
            "Initializing memory subsystem"
        );

        tokio::fs::create_dir_all(&config.storage_path).await?;
        let embedder = build_embedder(&config)?;
        let vectors = Arc::new(FileVectorStore::open(&config.storage_path).await?);
        let metadata = Arc::new(JsonMetadataStore::open(&config.storage_path).await?);

        let mut memory = Self::with_backends(config, embedder, vectors, metadata);
        memory.persistent = true;

        let report = memory.reconcile().await?;
        if report != ReconcileReport::default() {
            warn!(
                orphan_vectors_removed = report.orphan_vectors_removed,
                reembedded = report.reembedded,
                dropped = report.dropped,
                "Repaired memory store pairing"
            );
        }
        memory.load_superseded().await?;
        Ok(memory)
    }

    /// In-memory stores; nothing touches the filesystem.
    pub fn ephemeral(config: MemoryConfig) -> Result<Self, MemoryError> {
        let embedder = build_embedder(&config)?;
        Ok(Self::with_backends(
            config,
            embedder,
            Arc::new(FileVectorStore::ephemeral()),
            Arc::new(JsonMetadataStore::ephemeral()),
        ))
    }

    pub fn with_backends(
        config: MemoryConfig,
        embedder: Arc<dyn Embedder>,
        vectors: Arc<dyn VectorStore>,
        metadata: Arc<dyn MetadataStore>,
    ) -> Self {
        let cache = QueryCache::new(config.cache_size);
        Self {
            config,
            embedder,
            vectors,
            metadata,
            cache,
            superseded: RwLock::new(HashSet::new()),
            write_locks: DashMap::new(),
            persistent: false,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// A query carrying the configured `top_k` and threshold.
    pub fn query_for(&self, text: impl Into<String>) -> MemoryQuery {
        MemoryQuery::new(text)
            .with_top_k(self.config.top_k)
            .with_threshold(self.config.distance_threshold)
    }

    pub fn infer_topics(&self, text: &str) -> BTreeSet<String> {
        infer_topics(text)
    }

    /// Delete vectors without metadata; re-embed metadata without vectors,
    /// dropping records that cannot be re-embedded.
    pub async fn reconcile(&self) -> Result<ReconcileReport, MemoryError> {
        let mut report = ReconcileReport::default();
        let vector_ids: HashSet<EntryId> = self.vectors.ids().await?.into_iter().collect();
        let records = self.metadata.all().await?;
        let record_ids: HashSet<&str> = records.iter().map(|r| r.id()).collect();

        for id in vector_ids.iter().filter(|id| !record_ids.contains(id.as_str())) {
            self.vectors.delete(id).await?;
            report.orphan_vectors_removed += 1;
        }

        for record in records.iter().filter(|r| !vector_ids.contains(r.id())) {
            let embedded = self.embedder.embed(record.embedding_text()).await;
            let upserted = match embedded {
                Ok(vector) => self
                    .vectors
                    .upsert(record.collection(), record.id(), vector)
                    .await
                    .is_ok(),
                Err(_) => false,
            };
            if upserted {
                report.reembedded += 1;
            } else {
                self.metadata.remove(record.id()).await?;
                report.dropped += 1;
            }
        }

        Ok(report)
    }

    async fn load_superseded(&self) -> Result<(), MemoryError> {
        let ids: HashSet<EntryId> = self
            .metadata
            .all()
            .await?
            .into_iter()
            .filter_map(|r| r.into_knowledge())
            .filter_map(|e| e.source_provenance.supersedes)
            .collect();
        *self.superseded.write().await = ids;
        Ok(())
    }

    /// Store a knowledge entry or conversation record in both stores.
    ///
    /// Missing topics and keywords are inferred from the text. If the vector
    /// write fails the metadata write is undone and a storage error returned.
    /// Cached queries whose topics overlap the record, or that returned an
    /// entry this record supersedes, are invalidated before this returns.
    #[instrument(skip(self, record))]
    pub async fn store(&self, record: impl Into<StoredRecord>) -> Result<EntryId, MemoryError> {
        let mut record = record.into();
        fill_inferred_fields(&mut record);
        let id = record.id().to_string();
        let collection = record.collection();
        let topics = record.topics().clone();
        let replaced: Vec<EntryId> = record
            .as_knowledge()
            .and_then(|e| e.source_provenance.supersedes.clone())
            .into_iter()
            .collect();

        let lock = self.write_locks.entry(id.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.write_pair(record, &id, collection).await
        };
        drop(lock);
        self.write_locks
            .remove_if(&id, |_, l| Arc::strong_count(l) == 1);
        result?;

        let invalidated = self.cache.invalidate(&topics, &replaced).await;
        debug!(
            entry_id = %id,
            collection = ?collection,
            invalidated,
            "Stored memory record"
        );
        Ok(id)
    }

    async fn write_pair(
        &self,
        record: StoredRecord,
        id: &str,
        collection: Collection,
    ) -> Result<(), MemoryError> {
        if self.metadata.get(id).await?.is_some() {
            return Err(MemoryError::AlreadyExists(id.to_string()));
        }

        let vector = self.embedder.embed(record.embedding_text()).await?;
        let supersedes = record
            .as_knowledge()
            .and_then(|e| e.source_provenance.supersedes.clone());

        self.metadata.insert(record).await?;

        if let Err(e) = self.vectors.upsert(collection, id, vector).await {
            warn!(entry_id = %id, error = %e, "Vector write failed, removing metadata");
            if let Err(rollback) = self.metadata.remove(id).await {
                error!(entry_id = %id, error = %rollback, "Compensating metadata delete failed");
            }
            return Err(MemoryError::Storage(format!(
                "vector write failed for {id}: {e}"
            )));
        }

        if let Some(old) = supersedes {
            self.superseded.write().await.insert(old);
        }
        Ok(())
    }

    /// Store `entry` as the replacement for `old_id`. The old entry is kept
    /// but no longer returned by similarity or keyword queries.
    pub async fn supersede(
        &self,
        old_id: &str,
        mut entry: KnowledgeEntry,
    ) -> Result<EntryId, MemoryError> {
        match self.metadata.get(old_id).await? {
            Some(StoredRecord::Knowledge(_)) => {}
            _ => {
                return Err(MemoryError::Storage(format!(
                    "cannot supersede unknown knowledge entry {old_id}"
                )))
            }
        }
        entry.source_provenance.supersedes = Some(old_id.to_string());
        self.store(entry).await
    }

    /// Knowledge entries nearest to the query text, ascending by distance,
    /// ties broken by most recent `created_at`.
    #[instrument(skip(self, query), fields(top_k = query.top_k))]
    pub async fn query_similar(
        &self,
        query: &MemoryQuery,
    ) -> Result<Vec<(KnowledgeEntry, f32)>, MemoryError> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }

        let vector = self
            .embedder
            .embed(&query.query_text)
            .await
            .map_err(|e| MemoryError::BackendUnavailable(e.to_string()))?;

        let mut fetch = if query.topic_filter.is_some() {
            usize::MAX
        } else {
            query.top_k.saturating_add(TIE_SLACK)
        };
        loop {
            let candidates = self
                .vectors
                .search(Collection::Knowledge, &vector, fetch)
                .await
                .map_err(|e| MemoryError::BackendUnavailable(e.to_string()))?;
            let exhausted = candidates.len() < fetch;
            let farthest = candidates.last().map(|(_, d)| *d);

            let mut results = Vec::with_capacity(candidates.len());
            {
                let superseded = self.superseded.read().await;
                for (id, distance) in candidates {
                    if superseded.contains(&id) {
                        continue;
                    }
                    let Some(record) = self.metadata.get(&id).await? else {
                        warn!(entry_id = %id, "Vector has no metadata record, skipping");
                        continue;
                    };
                    let Some(entry) = record.into_knowledge() else {
                        continue;
                    };
                    if !matches_filter(&entry, query.topic_filter.as_ref()) {
                        continue;
                    }
                    results.push((entry, distance));
                }
            }

            results.sort_by(|a, b| {
                a.1.total_cmp(&b.1)
                    .then_with(|| b.0.created_at.cmp(&a.0.created_at))
            });

            // Unfetched candidates are at least `farthest` away, so the
            // window is settled once the last kept slot is strictly closer.
            let settled = match (results.get(query.top_k - 1), farthest) {
                (Some((_, kth)), Some(farthest)) => *kth < farthest,
                _ => false,
            };
            if exhausted || settled {
                results.truncate(query.top_k);
                return Ok(results);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    /// Knowledge entries whose topics or keywords contain any of `terms`,
    /// most matches first, then most recent.
    pub async fn query_keyword(&self, terms: &[String]) -> Result<Vec<KnowledgeEntry>, MemoryError> {
        let terms: Vec<String> = terms
            .iter()
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let superseded = self.superseded.read().await;
        let mut scored: Vec<(usize, KnowledgeEntry)> = self
            .metadata
            .all()
            .await?
            .into_iter()
            .filter_map(|r| r.into_knowledge())
            .filter(|e| !superseded.contains(&e.id))
            .filter_map(|entry| {
                let matched = terms
                    .iter()
                    .filter(|term| {
                        entry
                            .topics
                            .iter()
                            .chain(entry.keywords.iter())
                            .any(|field| field.contains(term.as_str()))
                    })
                    .count();
                (matched > 0).then_some((matched, entry))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.created_at.cmp(&a.1.created_at))
        });
        Ok(scored.into_iter().map(|(_, e)| e).collect())
    }

    /// Hybrid read path: cache, then vector search, then keyword match.
    ///
    /// Never fails; the returned source says which path answered.
    pub async fn lookup(&self, query: &MemoryQuery) -> MemoryLookup {
        let key = CacheKey::for_query(query);
        let generation = self.cache.generation().await;
        if let Some(hits) = self.cache.get(&key).await {
            debug!(query = %query.query_text, "Memory cache hit");
            return MemoryLookup {
                hits,
                source: LookupSource::Cache,
            };
        }

        let reason = match self.query_similar(query).await {
            Ok(results) if !results.is_empty() => {
                let hits: Vec<MemoryHit> = results
                    .into_iter()
                    .map(|(entry, distance)| MemoryHit {
                        entry,
                        distance: Some(distance),
                    })
                    .collect();
                let mut topics = infer_topics(&query.query_text);
                if let Some(filter) = &query.topic_filter {
                    topics.extend(filter.iter().cloned());
                }
                self.cache
                    .insert_if_current(generation, key, topics, hits.clone())
                    .await;
                return MemoryLookup {
                    hits,
                    source: LookupSource::Vector,
                };
            }
            Ok(_) => "no vector results".to_string(),
            Err(e) => {
                warn!(error = %e, "Vector search failed, using keyword fallback");
                e.to_string()
            }
        };

        let mut terms: BTreeSet<String> = extract_keywords(&query.query_text);
        terms.extend(infer_topics(&query.query_text));
        let terms: Vec<String> = terms.into_iter().collect();

        match self.query_keyword(&terms).await {
            Ok(entries) => MemoryLookup {
                hits: entries
                    .into_iter()
                    .filter(|e| matches_filter(e, query.topic_filter.as_ref()))
                    .take(query.top_k)
                    .map(|entry| MemoryHit {
                        entry,
                        distance: None,
                    })
                    .collect(),
                source: LookupSource::KeywordFallback { reason },
            },
            Err(e) => {
                warn!(error = %e, "Keyword fallback failed");
                MemoryLookup {
                    hits: Vec::new(),
                    source: LookupSource::Unavailable {
                        reason: format!("{reason}; keyword fallback: {e}"),
                    },
                }
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<KnowledgeEntry>, MemoryError> {
        Ok(self.metadata.get(id).await?.and_then(|r| r.into_knowledge()))
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Option<ConversationRecord>, MemoryError> {
        Ok(self
            .metadata
            .get(id)
            .await?
            .and_then(|r| r.into_conversation()))
    }

    /// Newest first.
    pub async fn recent_conversations(
        &self,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, MemoryError> {
        let mut conversations: Vec<ConversationRecord> = self
            .metadata
            .all()
            .await?
            .into_iter()
            .filter_map(|r| r.into_conversation())
            .collect();
        conversations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        conversations.truncate(limit);
        Ok(conversations)
    }

    /// Past conversations whose query is closest to `text`.
    pub async fn query_conversations(
        &self,
        text: &str,
        top_k: usize,
    ) -> Result<Vec<(ConversationRecord, f32)>, MemoryError> {
        let vector = self.embedder.embed(text).await?;
        let candidates = self
            .vectors
            .search(Collection::Conversations, &vector, top_k)
            .await?;

        let mut results = Vec::with_capacity(candidates.len());
        for (id, distance) in candidates {
            if let Some(conversation) = self.get_conversation(&id).await? {
                results.push((conversation, distance));
            }
        }
        Ok(results)
    }

    pub async fn stats(&self) -> Result<MemoryStats, MemoryError> {
        let records = self.metadata.all().await?;
        let knowledge_entries = records
            .iter()
            .filter(|r| r.collection() == Collection::Knowledge)
            .count();
        Ok(MemoryStats {
            knowledge_entries,
            conversations: records.len() - knowledge_entries,
            superseded: self.superseded.read().await.len(),
            cached_queries: self.cache.len().await,
            storage_path: self
                .persistent
                .then(|| self.config.storage_path.clone()),
        })
    }
}

fn fill_inferred_fields(record: &mut StoredRecord) {
    match record {
        StoredRecord::Knowledge(entry) => {
            if entry.keywords.is_empty() {
                entry.keywords = extract_keywords(&entry.text);
            }
            if entry.topics.is_empty() {
                entry.topics = infer_topics(&entry.text);
            }
        }
        StoredRecord::Conversation(conversation) => {
            if conversation.topics.is_empty() {
                conversation.topics = infer_topics(&conversation.query);
            }
        }
    }
}

fn matches_filter(entry: &KnowledgeEntry, filter: Option<&BTreeSet<String>>) -> bool {
    filter.map_or(true, |f| !entry.topics.is_disjoint(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;

    fn memory() -> MemorySubsystem {
        MemorySubsystem::ephemeral(MemoryConfig::default()).unwrap()
    }

    struct FailingVectors;

    #[async_trait]
    impl VectorStore for FailingVectors {
        async fn upsert(&self, _: Collection, _: &str, _: Vec<f32>) -> Result<(), MemoryError> {
            Err(MemoryError::Storage("disk full".into()))
        }
        async fn delete(&self, _: &str) -> Result<bool, MemoryError> {
            Ok(false)
        }
        async fn search(
            &self,
            _: Collection,
            _: &[f32],
            _: usize,
        ) -> Result<Vec<(EntryId, f32)>, MemoryError> {
            Err(MemoryError::BackendUnavailable("index offline".into()))
        }
        async fn ids(&self) -> Result<Vec<EntryId>, MemoryError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_store_fills_topics_and_keywords() {
        let memory = memory();
        let id = memory
            .store(KnowledgeEntry::new("Types of neural networks", "seed"))
            .await
            .unwrap();

        let entry = memory.get(&id).await.unwrap().unwrap();
        assert!(entry.topics.contains("neural_networks"));
        assert!(entry.keywords.contains("network"));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let memory = memory();
        let entry = KnowledgeEntry::new("transformers", "seed");
        memory.store(entry.clone()).await.unwrap();
        let err = memory.store(entry).await.unwrap_err();
        assert!(matches!(err, MemoryError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_vector_failure_rolls_back_metadata() {
        let metadata = Arc::new(JsonMetadataStore::ephemeral());
        let memory = MemorySubsystem::with_backends(
            MemoryConfig::default(),
            build_embedder(&MemoryConfig::default()).unwrap(),
            Arc::new(FailingVectors),
            metadata.clone(),
        );

        let entry = KnowledgeEntry::new("transformers", "seed");
        let id = entry.id.clone();
        let err = memory.store(entry).await.unwrap_err();

        assert!(matches!(err, MemoryError::Storage(_)));
        assert!(metadata.get(&id).await.unwrap().is_none());
        assert!(memory.write_locks.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_keywords_when_backend_down() {
        let metadata = Arc::new(JsonMetadataStore::ephemeral());
        metadata
            .insert(
                KnowledgeEntry::new("transformers", "seed")
                    .with_topics(["transformers"])
                    .with_keywords(["attention"])
                    .into(),
            )
            .await
            .unwrap();
        let memory = MemorySubsystem::with_backends(
            MemoryConfig::default(),
            build_embedder(&MemoryConfig::default()).unwrap(),
            Arc::new(FailingVectors),
            metadata,
        );

        let lookup = memory.lookup(&memory.query_for("How does attention work?")).await;
        assert!(matches!(lookup.source, LookupSource::KeywordFallback { .. }));
        assert_eq!(lookup.hits.len(), 1);
        assert!(lookup.hits[0].distance.is_none());
    }

    #[tokio::test]
    async fn test_lookup_uses_cache_until_overlapping_store() {
        let memory = memory();
        memory
            .store(
                KnowledgeEntry::new("What are transformers?", "research")
                    .with_payload(json!({ "topics": ["transformers"] }), 0.9),
            )
            .await
            .unwrap();

        let query = memory.query_for("What are transformers?");
        assert_eq!(memory.lookup(&query).await.source, LookupSource::Vector);
        assert_eq!(memory.lookup(&query).await.source, LookupSource::Cache);

        memory
            .store(KnowledgeEntry::new("transformers use attention", "research"))
            .await
            .unwrap();
        assert_eq!(memory.lookup(&query).await.source, LookupSource::Vector);
    }

    #[tokio::test]
    async fn test_supersede_hides_old_entry() {
        let memory = memory();
        let old = memory
            .store(KnowledgeEntry::new("transformers", "research"))
            .await
            .unwrap();
        let new = memory
            .supersede(&old, KnowledgeEntry::new("transformers", "research"))
            .await
            .unwrap();

        let results = memory.query_similar(&memory.query_for("transformers")).await.unwrap();
        let ids: Vec<_> = results.iter().map(|(e, _)| e.id.clone()).collect();
        assert_eq!(ids, vec![new.clone()]);

        let replacement = memory.get(&new).await.unwrap().unwrap();
        assert_eq!(replacement.source_provenance.supersedes.as_deref(), Some(old.as_str()));
        assert!(memory.get(&old).await.unwrap().is_some());

        assert!(memory.supersede("kn_missing", KnowledgeEntry::new("x", "r")).await.is_err());
    }

    #[tokio::test]
    async fn test_supersede_drops_cached_results_across_topics() {
        let memory = memory();
        let old = memory
            .store(KnowledgeEntry::new("attention models", "research").with_topics(["transformers"]))
            .await
            .unwrap();

        let query = memory.query_for("attention models");
        let first = memory.lookup(&query).await;
        assert_eq!(first.source, LookupSource::Vector);
        assert_eq!(first.hits[0].entry.id, old);

        memory
            .supersede(
                &old,
                KnowledgeEntry::new("slow braised stew", "research").with_topics(["cooking"]),
            )
            .await
            .unwrap();

        let second = memory.lookup(&query).await;
        assert_ne!(second.source, LookupSource::Cache);
        assert!(second.hits.iter().all(|h| h.entry.id != old));
    }

    #[tokio::test]
    async fn test_recency_tie_break_beyond_first_window() {
        let memory = memory();
        let base = chrono::Utc::now() - chrono::Duration::hours(1);
        // Identical text means identical distance. The vector store orders
        // ties by id, so the newest entry sorts last among them.
        for i in 0..(TIE_SLACK + 4) {
            let mut entry = KnowledgeEntry::new("convolutional filters", "research")
                .with_created_at(base + chrono::Duration::seconds(i as i64));
            entry.id = format!("kn_{i:02}");
            entry.embedding_ref = entry.id.clone();
            memory.store(entry).await.unwrap();
        }

        let query = memory.query_for("convolutional filters").with_top_k(1);
        let results = memory.query_similar(&query).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0.id, format!("kn_{:02}", TIE_SLACK + 3));
    }
}
