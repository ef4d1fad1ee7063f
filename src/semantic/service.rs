//! Semantic similarity service for notes.
//!
//! Provides a high-level interface over the embedding engine:
//! - Lazy-loads the embedding model on first use
//! - Owns the text cache, the note index and their persistence
//! - Coordinates similarity search and bulk indexing

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::SemanticSearchConfig;
use crate::notes::{NoteId, NoteRecord};
use crate::semantic::batch::{BatchProcessor, BatchReport};
use crate::semantic::cache::VectorCache;
use crate::semantic::embeddings::{EmbeddingError, ModelLoader};
use crate::semantic::index::{NoteVectorIndex, UpsertOutcome};
use crate::semantic::search::{SimilarityResult, SimilaritySearch};
use crate::semantic::storage::{FileVectorStore, VectorStore};
use crate::semantic::writer::StoreWriter;

/// Directory under the base path holding persisted vectors
const VECTORS_DIR: &str = "vectors";

/// Snapshot of the service state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub cache_size: usize,
    pub indexed_note_count: usize,
    pub in_flight_count: usize,
    pub model_loaded: bool,
    pub model_loading: bool,
}

/// Service for embedding notes and finding similar ones.
///
/// Constructed explicitly and shared by reference or `Arc`; every method
/// takes `&self`.
pub struct SemanticService {
    loader: Arc<ModelLoader>,
    writer: Arc<StoreWriter>,
    cache: Arc<VectorCache>,
    index: Arc<NoteVectorIndex>,
    search: SimilaritySearch,
    batch: BatchProcessor,
}

impl SemanticService {
    /// Create a service from an injected loader and store.
    ///
    /// Nothing is read from the store until `load` is called.
    pub fn new(
        config: &SemanticSearchConfig,
        loader: Arc<ModelLoader>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        let writer = Arc::new(StoreWriter::new(store));
        let cache = Arc::new(VectorCache::new(
            loader.clone(),
            writer.clone(),
            config.cache_max_entries,
        ));
        let index = Arc::new(NoteVectorIndex::new(cache.clone(), writer.clone()));
        let search = SimilaritySearch::new(cache.clone(), index.clone(), config.search_options());
        let batch = BatchProcessor::new(
            index.clone(),
            config.batch_size,
            Duration::from_millis(config.batch_pause_ms),
        );

        Self {
            loader,
            writer,
            cache,
            index,
            search,
            batch,
        }
    }

    /// Service backed by the configured fastembed model and a file store
    /// under `base_path`.
    pub fn open(config: &SemanticSearchConfig, base_path: &Path) -> Self {
        let loader = Arc::new(ModelLoader::fastembed(
            config.model.clone(),
            base_path.to_path_buf(),
            Duration::from_secs(config.download_timeout_secs),
        ));
        let store = Arc::new(FileVectorStore::new(base_path.join(VECTORS_DIR)));

        Self::new(config, loader, store)
    }

    /// Read persisted cache entries and note vectors into memory.
    pub async fn load(&self) {
        self.cache.load().await;
        self.index.load().await;
    }

    /// Load the model now and drop stored vectors it cannot be compared to.
    pub async fn initialize(&self) -> Result<(), EmbeddingError> {
        let provider = self.loader.get().await?;
        let dimensions = provider.dimensions();

        let dropped_cache = self.cache.retain_dimensions(dimensions);
        let dropped_notes = self.index.retain_dimensions(dimensions);
        if dropped_cache + dropped_notes > 0 {
            log::info!(
                "Dropped {} cached and {} note embeddings not matching model '{}' ({} dimensions)",
                dropped_cache,
                dropped_notes,
                provider.name(),
                dimensions
            );
        }

        Ok(())
    }

    /// Rank `notes` against `query`, embedding notes as needed.
    pub async fn find_similar<N: NoteRecord + Clone>(
        &self,
        query: &str,
        notes: &[N],
        max_results: usize,
    ) -> Vec<SimilarityResult<N>> {
        self.search.find_similar(query, notes, max_results).await
    }

    /// Rank the already indexed subset of `notes` against `query`.
    pub async fn find_similar_precomputed<N: NoteRecord + Clone>(
        &self,
        query: &str,
        notes: &[N],
        threshold: Option<f32>,
    ) -> Vec<SimilarityResult<N>> {
        self.search
            .find_similar_precomputed(query, notes, threshold)
            .await
    }

    /// Embed every note not yet indexed.
    pub async fn process_all<N>(&self, notes: &[N]) -> BatchReport
    where
        N: NoteRecord + Clone + Send + Sync + 'static,
    {
        self.batch.process_all(notes).await
    }

    /// Compute and store the vector of a single note.
    pub async fn upsert<N: NoteRecord + ?Sized>(
        &self,
        note: &N,
    ) -> Result<UpsertOutcome, EmbeddingError> {
        self.index.upsert(note).await
    }

    pub fn remove(&self, id: NoteId) {
        self.index.remove(id);
    }

    pub fn has(&self, id: NoteId) -> bool {
        self.index.has(id)
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        CacheStats {
            cache_size: self.cache.len(),
            indexed_note_count: self.index.len(),
            in_flight_count: self.index.in_flight_count(),
            model_loaded: self.loader.is_loaded(),
            model_loading: self.loader.is_loading(),
        }
    }

    /// Wipe both in-memory maps and both persisted partitions.
    pub async fn clear_cache(&self) {
        self.cache.clear();
        self.index.clear();
        self.writer.flush().await;
        log::info!("Cleared embedding cache and note index");
    }

    /// Wait for pending background writes.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }
}
