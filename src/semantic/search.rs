//! Similarity search over notes.
//!
//! Two modes:
//! - on-demand: embeds every candidate note through the cache (fallback path)
//! - precomputed: scores only notes already in the index (primary path)

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;

use crate::notes::NoteRecord;
use crate::semantic::cache::VectorCache;
use crate::semantic::index::NoteVectorIndex;
use crate::semantic::preprocess::compose_note_text;
use crate::semantic::similarity::cosine_similarity;
use crate::semantic::SemanticError;

/// Default minimum score of on-demand search (exclusive)
pub const DEFAULT_ON_DEMAND_THRESHOLD: f32 = 0.1;

/// Default minimum score of precomputed search (inclusive)
pub const DEFAULT_PRECOMPUTED_THRESHOLD: f32 = 0.25;

/// Default result cap when precomputed search falls back to on-demand
pub const DEFAULT_FALLBACK_MAX_RESULTS: usize = 10;

/// Where the note vector behind a score came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorSource {
    /// Computed (or fetched from the text cache) during the query
    OnDemand,
    /// Taken from the note index
    Precomputed,
}

/// A note with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityResult<N> {
    #[serde(flatten)]
    pub note: N,
    /// Cosine similarity in [-1, 1]
    pub similarity: f32,
    pub source: VectorSource,
}

/// Thresholds and limits of the search engine.
#[derive(Debug, Clone, Copy)]
pub struct SearchOptions {
    pub on_demand_threshold: f32,
    pub precomputed_threshold: f32,
    pub fallback_max_results: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            on_demand_threshold: DEFAULT_ON_DEMAND_THRESHOLD,
            precomputed_threshold: DEFAULT_PRECOMPUTED_THRESHOLD,
            fallback_max_results: DEFAULT_FALLBACK_MAX_RESULTS,
        }
    }
}

pub struct SimilaritySearch {
    cache: Arc<VectorCache>,
    index: Arc<NoteVectorIndex>,
    options: SearchOptions,
}

impl SimilaritySearch {
    pub fn new(cache: Arc<VectorCache>, index: Arc<NoteVectorIndex>, options: SearchOptions) -> Self {
        Self {
            cache,
            index,
            options,
        }
    }

    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    /// Rank all `notes` against `query`, embedding each note as needed.
    ///
    /// Keeps scores above the on-demand threshold, best first, at most
    /// `max_results`. Best effort: any failure yields an empty result.
    pub async fn find_similar<N: NoteRecord + Clone>(
        &self,
        query: &str,
        notes: &[N],
        max_results: usize,
    ) -> Vec<SimilarityResult<N>> {
        match self.try_find_similar(query, notes, max_results).await {
            Ok(results) => results,
            Err(e) => {
                log::error!("Error in similarity search: {}", e);
                vec![]
            }
        }
    }

    /// Rank the indexed subset of `notes` against `query`.
    ///
    /// Notes without a vector in the index are skipped. Keeps scores at or
    /// above `threshold` (precomputed threshold if `None`), best first. On
    /// failure, falls back to on-demand search capped at
    /// `min(notes.len(), fallback_max_results)`.
    pub async fn find_similar_precomputed<N: NoteRecord + Clone>(
        &self,
        query: &str,
        notes: &[N],
        threshold: Option<f32>,
    ) -> Vec<SimilarityResult<N>> {
        let threshold = threshold.unwrap_or(self.options.precomputed_threshold);

        match self.try_find_similar_precomputed(query, notes, threshold).await {
            Ok(results) => {
                log::info!(
                    "Found {} similar notes using pre-computed embeddings (threshold: {})",
                    results.len(),
                    threshold
                );
                results
            }
            Err(e) => {
                log::error!("Error in precomputed similarity search: {}", e);
                let max_results = notes.len().min(self.options.fallback_max_results);
                self.find_similar(query, notes, max_results).await
            }
        }
    }

    async fn try_find_similar<N: NoteRecord + Clone>(
        &self,
        query: &str,
        notes: &[N],
        max_results: usize,
    ) -> Result<Vec<SimilarityResult<N>>, SemanticError> {
        let query_vector = self.cache.get_or_compute(query).await?;

        let mut results = Vec::with_capacity(notes.len());
        for note in notes {
            let text = compose_note_text(note.title(), note.content());
            let note_vector = match self.cache.get_or_compute(&text).await {
                Ok(vector) => vector,
                Err(e) => {
                    log::warn!("Failed to embed note {}: {}", note.id(), e);
                    vec![0.0; query_vector.len()]
                }
            };

            let similarity = cosine_similarity(&query_vector, &note_vector)?;
            if similarity > self.options.on_demand_threshold {
                results.push(SimilarityResult {
                    note: note.clone(),
                    similarity,
                    source: VectorSource::OnDemand,
                });
            }
        }

        sort_by_similarity(&mut results);
        results.truncate(max_results);

        Ok(results)
    }

    async fn try_find_similar_precomputed<N: NoteRecord + Clone>(
        &self,
        query: &str,
        notes: &[N],
        threshold: f32,
    ) -> Result<Vec<SimilarityResult<N>>, SemanticError> {
        let query_vector = self.cache.get_or_compute(query).await?;

        let mut results = Vec::new();
        for note in notes {
            let Some(note_vector) = self.index.get(note.id()) else {
                continue;
            };

            let similarity = cosine_similarity(&query_vector, &note_vector)?;
            if similarity >= threshold {
                results.push(SimilarityResult {
                    note: note.clone(),
                    similarity,
                    source: VectorSource::Precomputed,
                });
            }
        }

        sort_by_similarity(&mut results);

        Ok(results)
    }
}

/// Sort by score descending. Stable, so ties keep input order.
fn sort_by_similarity<N>(results: &mut [SimilarityResult<N>]) {
    results.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(Ordering::Equal)
    });
}
