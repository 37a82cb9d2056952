//! Embedding generation for vector search.
//!
//! The default [`HashingEmbedder`] is deterministic and needs no model
//! download. With the `fastembed` feature a model-backed embedder is
//! available through the same [`Embedder`] trait.

use crate::error::MemoryError;
use crate::topics::{is_stop_word, tokenize};
use crate::types::MemoryConfig;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Turns text into a fixed-size vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError>;
}

/// Feature-hashing bag-of-words embedder.
///
/// Each content token is hashed with SHA-256 into a bucket and a sign, and the
/// result is L2-normalized. Identical texts always produce identical vectors;
/// a text with no content tokens produces the zero vector.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Result<Self, MemoryError> {
        if dimension == 0 {
            return Err(MemoryError::Embedding(
                "embedding dimension must be greater than zero".into(),
            ));
        }
        Ok(Self { dimension })
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in tokenize(text) {
            if is_stop_word(&token) {
                continue;
            }
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket_bytes = [0u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = (u64::from_le_bytes(bucket_bytes) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
        Ok(self.embed_sync(text))
    }
}

/// Build the embedder named by `config.embedding_model`.
pub fn build_embedder(config: &MemoryConfig) -> Result<Arc<dyn Embedder>, MemoryError> {
    match config.embedding_model.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.embedding_dim)?)),
        #[cfg(feature = "fastembed")]
        model => Ok(Arc::new(model_backed::FastEmbedder::from_config(
            model,
            config.embedding_dim,
        )?)),
        #[cfg(not(feature = "fastembed"))]
        model => Err(MemoryError::Embedding(format!(
            "embedding model '{model}' requires the `fastembed` feature"
        ))),
    }
}

#[cfg(feature = "fastembed")]
pub use model_backed::FastEmbedder;

#[cfg(feature = "fastembed")]
mod model_backed {
    use super::*;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
    use once_cell::sync::OnceCell;
    use tracing::{debug, info, instrument};

    /// fastembed-backed embedder with lazy model initialization.
    pub struct FastEmbedder {
        model_name: EmbeddingModel,
        dimension: usize,
        model: OnceCell<Arc<TextEmbedding>>,
    }

    impl FastEmbedder {
        /// Resolve a model name and check it produces `expected_dim` vectors.
        pub fn from_config(model_name: &str, expected_dim: usize) -> Result<Self, MemoryError> {
            let (model, dimension) = match model_name {
                "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (EmbeddingModel::AllMiniLML6V2, 384),
                "all-MiniLM-L12-v2" | "AllMiniLML12V2" => (EmbeddingModel::AllMiniLML12V2, 384),
                "bge-small-en-v1.5" | "BGESmallENV15" => (EmbeddingModel::BGESmallENV15, 384),
                "bge-base-en-v1.5" | "BGEBaseENV15" => (EmbeddingModel::BGEBaseENV15, 768),
                "nomic-embed-text-v1.5" | "NomicEmbedTextV15" => {
                    (EmbeddingModel::NomicEmbedTextV15, 768)
                }
                _ => {
                    return Err(MemoryError::Embedding(format!(
                        "Unknown embedding model: '{model_name}'. Supported models: hashing, all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, etc."
                    )));
                }
            };
            if dimension != expected_dim {
                return Err(MemoryError::Embedding(format!(
                    "Dimension mismatch: model '{model_name}' produces {dimension}-dim vectors but config specifies {expected_dim}"
                )));
            }
            Ok(Self {
                model_name: model,
                dimension,
                model: OnceCell::new(),
            })
        }

        #[instrument(skip(self))]
        fn get_or_init_model(&self) -> Result<Arc<TextEmbedding>, MemoryError> {
            self.model
                .get_or_try_init(|| {
                    info!(model = ?self.model_name, "Initializing embedding model");
                    let mut options = InitOptions::new(self.model_name.clone());
                    options.show_download_progress = true;
                    let model = TextEmbedding::try_new(options)
                        .map_err(|e| MemoryError::Embedding(e.to_string()))?;
                    Ok(Arc::new(model))
                })
                .cloned()
        }
    }

    #[async_trait]
    impl Embedder for FastEmbedder {
        fn dimension(&self) -> usize {
            self.dimension
        }

        #[instrument(skip(self, text), fields(text_len = text.len()))]
        async fn embed(&self, text: &str) -> Result<Vec<f32>, MemoryError> {
            let model = self.get_or_init_model()?;
            let text = text.to_string();

            // fastembed is synchronous
            let embeddings = tokio::task::spawn_blocking(move || {
                model
                    .embed(vec![text], None)
                    .map_err(|e| MemoryError::Embedding(e.to_string()))
            })
            .await
            .map_err(|e| MemoryError::Embedding(format!("embedding task failed: {e}")))??;

            debug!(count = embeddings.len(), "Generated embedding");
            embeddings
                .into_iter()
                .next()
                .ok_or_else(|| MemoryError::Embedding("Empty embedding result".into()))
        }
    }

}
