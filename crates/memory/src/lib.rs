//! Memory subsystem for Conclave.
//!
//! Two stores share one identity space:
//!
//! - **Vector store**: embeddings for similarity search (`vectors.json`)
//! - **Metadata store**: structured records with topics and keywords (`metadata.json`)
//!
//! A bounded LRU cache sits in front of similarity search, and a
//! [`ReusePolicy`] decides whether a hit can stand in for fresh work.
//!
//! # Read path
//!
//! ```text
//! lookup(query)
//!   ├─ cache hit ──────────────────────────▶ Cache
//!   ├─ vector search (non-empty) ──────────▶ Vector      (cached)
//!   └─ backend error / no results
//!        └─ keyword match on topics+keywords ▶ KeywordFallback
//! ```
//!
//! Writes go through [`MemorySubsystem::store`] only. A write that lands in
//! one store but not the other is rolled back and reported as an error.

pub mod cache;
pub mod embedding;
pub mod error;
pub mod metadata;
mod persist;
pub mod reuse;
pub mod store;
pub mod topics;
pub mod types;
pub mod vector;

pub use cache::QueryCache;
pub use embedding::{build_embedder, Embedder, HashingEmbedder};
pub use error::MemoryError;
pub use metadata::{JsonMetadataStore, MetadataStore};
pub use reuse::{ReusePolicy, ReuseVerdict};
pub use store::{LookupSource, MemoryLookup, MemorySubsystem, ReconcileReport};
pub use types::{
    Collection, ConversationRecord, EntryId, KnowledgeEntry, MemoryConfig, MemoryHit,
    MemoryQuery, MemoryStats, Provenance, StoredRecord,
};
pub use vector::{cosine_distance, FileVectorStore, VectorStore};
