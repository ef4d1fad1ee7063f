//! Semantic similarity for notes.
//!
//! Notes are embedded locally with fastembed-rs and compared by cosine
//! similarity. Embeddings are kept in memory and mirrored to a file store so
//! a restart does not recompute them.
//!
//! # Architecture
//!
//! - `embeddings`: Embedding provider trait, fastembed model, lazy loader
//! - `preprocess`: Note text composition and content fingerprints
//! - `similarity`: Cosine similarity
//! - `storage`: Partitioned key/vector stores (file and memory)
//! - `writer`: Ordered background persistence
//! - `cache`: Text fingerprint -> vector cache
//! - `index`: Note id -> vector index with in-flight tracking
//! - `search`: On-demand and precomputed similarity search
//! - `batch`: Bulk index population
//! - `service`: Facade wiring the above together

pub mod batch;
pub mod cache;
pub mod embeddings;
pub mod index;
pub mod preprocess;
pub mod search;
pub mod service;
pub mod similarity;
pub mod storage;
pub mod writer;

pub use batch::{BatchProcessor, BatchReport};
pub use embeddings::{EmbeddingError, EmbeddingModel, EmbeddingProvider, ModelLoader};
pub use search::{SearchOptions, SimilarityResult, SimilaritySearch, VectorSource};
pub use service::{CacheStats, SemanticService};
pub use similarity::{cosine_similarity, SimilarityError};
pub use storage::{FileVectorStore, MemoryVectorStore, Partition, StoreError, VectorStore};

/// Dense embedding vector
pub type Vector = Vec<f32>;

/// Default embedding model name
pub const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";

/// Errors surfaced by search internals before they are absorbed into empty
/// results.
#[derive(Debug, thiserror::Error)]
pub enum SemanticError {
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Similarity(#[from] SimilarityError),
}
