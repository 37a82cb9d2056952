//! Memory record types and configuration.

use chrono::{DateTime, Utc};
use conclave_common::{Subtask, TaskResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Identity shared by a metadata record and its vector.
pub type EntryId = String;

/// Logical partition of the stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    /// Reuse candidates
    Knowledge,
    /// Stored interactions
    Conversations,
}

/// Where a knowledge entry came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Producer, e.g. `research` or `seed`
    pub source: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,

    /// Entry this one replaces. The old entry is kept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<EntryId>,
}

/// A reusable piece of knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: EntryId,

    /// Text that is embedded for similarity search
    pub text: String,

    /// ID of the vector in the vector store
    pub embedding_ref: EntryId,

    #[serde(default)]
    pub topics: BTreeSet<String>,

    #[serde(default)]
    pub keywords: BTreeSet<String>,

    pub source_provenance: Provenance,

    pub created_at: DateTime<Utc>,

    /// Result data this entry can stand in for
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Confidence of the result the entry was derived from
    #[serde(default = "default_entry_confidence")]
    pub confidence: f32,
}

fn default_entry_confidence() -> f32 {
    1.0
}

impl KnowledgeEntry {
    pub fn new(text: impl Into<String>, source: impl Into<String>) -> Self {
        let id = format!("kn_{}", uuid::Uuid::new_v4());
        Self {
            embedding_ref: id.clone(),
            id,
            text: text.into(),
            topics: BTreeSet::new(),
            keywords: BTreeSet::new(),
            source_provenance: Provenance {
                source: source.into(),
                ..Default::default()
            },
            created_at: Utc::now(),
            payload: serde_json::Value::Null,
            confidence: default_entry_confidence(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value, confidence: f32) -> Self {
        self.payload = payload;
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.source_provenance.task_id = Some(task_id.into());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// One completed query. Append-only; never edited after it is stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: EntryId,
    pub query: String,
    #[serde(default)]
    pub topics: BTreeSet<String>,
    pub subtask_plan: Vec<Subtask>,
    /// In plan order
    pub results: Vec<TaskResult>,
    pub final_response: String,
    pub overall_confidence: f32,
    pub timestamp: DateTime<Utc>,
}

impl ConversationRecord {
    pub fn new(
        query: impl Into<String>,
        subtask_plan: Vec<Subtask>,
        results: Vec<TaskResult>,
        final_response: impl Into<String>,
        overall_confidence: f32,
    ) -> Self {
        Self {
            id: format!("conv_{}", uuid::Uuid::new_v4()),
            query: query.into(),
            topics: BTreeSet::new(),
            subtask_plan,
            results,
            final_response: final_response.into(),
            overall_confidence,
            timestamp: Utc::now(),
        }
    }
}

/// Anything the memory subsystem can store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredRecord {
    Knowledge(KnowledgeEntry),
    Conversation(ConversationRecord),
}

impl StoredRecord {
    pub fn id(&self) -> &str {
        match self {
            StoredRecord::Knowledge(e) => &e.id,
            StoredRecord::Conversation(c) => &c.id,
        }
    }

    pub fn collection(&self) -> Collection {
        match self {
            StoredRecord::Knowledge(_) => Collection::Knowledge,
            StoredRecord::Conversation(_) => Collection::Conversations,
        }
    }

    /// Text the vector is computed from.
    pub fn embedding_text(&self) -> &str {
        match self {
            StoredRecord::Knowledge(e) => &e.text,
            StoredRecord::Conversation(c) => &c.query,
        }
    }

    pub fn topics(&self) -> &BTreeSet<String> {
        match self {
            StoredRecord::Knowledge(e) => &e.topics,
            StoredRecord::Conversation(c) => &c.topics,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            StoredRecord::Knowledge(e) => e.created_at,
            StoredRecord::Conversation(c) => c.timestamp,
        }
    }

    pub fn as_knowledge(&self) -> Option<&KnowledgeEntry> {
        match self {
            StoredRecord::Knowledge(e) => Some(e),
            StoredRecord::Conversation(_) => None,
        }
    }

    pub fn into_knowledge(self) -> Option<KnowledgeEntry> {
        match self {
            StoredRecord::Knowledge(e) => Some(e),
            StoredRecord::Conversation(_) => None,
        }
    }

    pub fn into_conversation(self) -> Option<ConversationRecord> {
        match self {
            StoredRecord::Conversation(c) => Some(c),
            StoredRecord::Knowledge(_) => None,
        }
    }
}

impl From<KnowledgeEntry> for StoredRecord {
    fn from(entry: KnowledgeEntry) -> Self {
        StoredRecord::Knowledge(entry)
    }
}

impl From<ConversationRecord> for StoredRecord {
    fn from(record: ConversationRecord) -> Self {
        StoredRecord::Conversation(record)
    }
}

/// A read-only similarity request. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryQuery {
    pub query_text: String,
    pub top_k: usize,
    /// Reuse cutoff; candidates beyond it are still returned
    pub distance_threshold: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_filter: Option<BTreeSet<String>>,
}

impl MemoryQuery {
    pub fn new(query_text: impl Into<String>) -> Self {
        Self {
            query_text: query_text.into(),
            top_k: default_top_k(),
            distance_threshold: default_distance_threshold(),
            topic_filter: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.distance_threshold = threshold;
        self
    }

    pub fn with_topic_filter<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topic_filter = Some(topics.into_iter().map(Into::into).collect());
        self
    }
}

/// A candidate returned by a lookup.
///
/// `distance` is `None` for keyword-fallback hits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub entry: KnowledgeEntry,
    pub distance: Option<f32>,
}

/// Summary counts for the memory subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub knowledge_entries: usize,
    pub conversations: usize,
    pub superseded: usize,
    pub cached_queries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
}

/// Configuration for the memory subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Root directory for `metadata.json` and `vectors.json`
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// `hashing`, or a fastembed model name when built with `fastembed`
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Candidates returned per similarity query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Maximum cosine distance at which an entry may be reused
    #[serde(default = "default_distance_threshold")]
    pub distance_threshold: f32,

    /// Maximum cached query result sets
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("./data/memory")
}

fn default_embedding_model() -> String {
    "hashing".into()
}

fn default_embedding_dim() -> usize {
    256
}

fn default_top_k() -> usize {
    3
}

fn default_distance_threshold() -> f32 {
    0.2
}

fn default_cache_size() -> usize {
    64
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            storage_path: default_storage_path(),
            embedding_model: default_embedding_model(),
            embedding_dim: default_embedding_dim(),
            top_k: default_top_k(),
            distance_threshold: default_distance_threshold(),
            cache_size: default_cache_size(),
        }
    }
}
