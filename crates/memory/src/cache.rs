//! Bounded LRU cache of similarity results.

use crate::topics::normalize_query;
use crate::types::{EntryId, MemoryHit, MemoryQuery};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    text: String,
    top_k: usize,
    topic_filter: Vec<String>,
}

impl CacheKey {
    pub fn for_query(query: &MemoryQuery) -> Self {
        Self {
            text: normalize_query(&query.query_text),
            top_k: query.top_k,
            topic_filter: query
                .topic_filter
                .as_ref()
                .map(|f| f.iter().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
struct CachedResult {
    topics: BTreeSet<String>,
    hits: Vec<MemoryHit>,
}

impl CachedResult {
    /// Stale once a record on one of its topics is stored, or once an entry
    /// it returned is replaced. Results with no topics are always stale.
    fn is_stale(&self, topics: &BTreeSet<String>, replaced: &[EntryId]) -> bool {
        self.topics.is_empty()
            || !self.topics.is_disjoint(topics)
            || self.hits.iter().any(|h| replaced.contains(&h.entry.id))
    }
}

/// Query result sets, evicted least-recently-used first.
///
/// Every invalidation bumps a generation counter. A result computed before an
/// invalidation is refused by [`QueryCache::insert_if_current`], so a lookup
/// racing with a store can never cache a stale answer.
pub struct QueryCache {
    capacity: usize,
    entries: Cache<CacheKey, Arc<CachedResult>>,
    generation: Mutex<u64>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity as u64)
            .eviction_policy(EvictionPolicy::lru())
            .support_invalidation_closures()
            .eviction_listener(|key: Arc<CacheKey>, _, cause| {
                debug!(query = %key.text, ?cause, "Evicted query from cache");
            })
            .build();
        Self {
            capacity,
            entries,
            generation: Mutex::new(0),
        }
    }

    /// Number of cached result sets, after pending evictions are applied.
    pub async fn len(&self) -> usize {
        self.entries.run_pending_tasks().await;
        self.entries.entry_count() as usize
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn generation(&self) -> u64 {
        *self.generation.lock().await
    }

    pub async fn get(&self, key: &CacheKey) -> Option<Vec<MemoryHit>> {
        self.entries.get(key).await.map(|cached| cached.hits.clone())
    }

    /// Cache `hits` unless the cache was invalidated since `generation`.
    pub async fn insert_if_current(
        &self,
        generation: u64,
        key: CacheKey,
        topics: BTreeSet<String>,
        hits: Vec<MemoryHit>,
    ) -> bool {
        if self.capacity == 0 {
            return false;
        }
        let current = self.generation.lock().await;
        if *current != generation {
            return false;
        }
        self.entries
            .insert(key, Arc::new(CachedResult { topics, hits }))
            .await;
        true
    }

    /// Drop every cached query whose topics overlap `topics` or whose results
    /// include one of `replaced`, plus every cached query with no topics at
    /// all. Returns the number dropped.
    pub async fn invalidate(&self, topics: &BTreeSet<String>, replaced: &[EntryId]) -> usize {
        let mut generation = self.generation.lock().await;
        *generation += 1;

        let dropped = self
            .entries
            .iter()
            .filter(|(_, cached)| cached.is_stale(topics, replaced))
            .count();
        if dropped == 0 {
            return 0;
        }

        let topics = topics.clone();
        let replaced = replaced.to_vec();
        if let Err(e) = self
            .entries
            .invalidate_entries_if(move |_, cached| cached.is_stale(&topics, &replaced))
        {
            warn!(error = %e, "Selective invalidation unavailable, clearing query cache");
            self.entries.invalidate_all();
        }
        dropped
    }
}
