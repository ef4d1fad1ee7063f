//! Test doubles shared by unit and scenario tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::semantic::embeddings::{EmbeddingError, EmbeddingProvider};
use crate::semantic::storage::{Partition, StoreError, VectorStore};
use crate::semantic::Vector;

/// Deterministic bag-of-words provider.
///
/// Every distinct lowercase token is assigned the next dimension (wrapping at
/// `dims`), and a text embeds to its normalised token counts. Texts sharing
/// no tokens score 0, identical texts score 1.
pub struct StubProvider {
    dims: usize,
    reported_dims: usize,
    vocabulary: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    texts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl StubProvider {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            reported_dims: dims,
            vocabulary: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            texts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Fail whenever asked to embed exactly `text`.
    pub fn failing_on(self, text: &str) -> Self {
        self.failing.lock().unwrap().insert(text.to_string());
        self
    }

    /// Report a dimensionality different from the vectors actually produced.
    pub fn with_reported_dimensions(mut self, dims: usize) -> Self {
        self.reported_dims = dims;
        self
    }

    pub fn stop_failing(&self) {
        self.failing.lock().unwrap().clear();
    }

    /// Number of `embed` calls, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    /// Highest number of `embed` calls observed running at once.
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn vectorize(&self, text: &str) -> Vector {
        let mut vector = vec![0.0; self.dims];
        let mut vocabulary = self.vocabulary.lock().unwrap();

        for token in text.split_whitespace().map(str::to_lowercase) {
            let next = vocabulary.len();
            let slot = *vocabulary.entry(token).or_insert(next);
            vector[slot % self.dims] += 1.0;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    fn dimensions(&self) -> usize {
        self.reported_dims
    }

    async fn embed(&self, text: &str) -> Result<Vector, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.lock().unwrap().push(text.to_string());

        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        // let concurrent callers interleave
        tokio::task::yield_now().await;

        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(text) {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "stub refuses {:?}",
                text
            )));
        }

        Ok(self.vectorize(text))
    }
}

/// Store whose every operation fails.
pub struct FailingStore;

impl FailingStore {
    fn unavailable() -> StoreError {
        StoreError::Unavailable("failing store".to_string())
    }
}

impl VectorStore for FailingStore {
    fn get(&self, _: Partition, _: &str) -> Result<Option<Vector>, StoreError> {
        Err(Self::unavailable())
    }

    fn set(&self, _: Partition, _: &str, _: &[f32]) -> Result<(), StoreError> {
        Err(Self::unavailable())
    }

    fn delete(&self, _: Partition, _: &str) -> Result<(), StoreError> {
        Err(Self::unavailable())
    }

    fn entries(&self, _: Partition) -> Result<Vec<(String, Vector)>, StoreError> {
        Err(Self::unavailable())
    }

    fn clear(&self, _: Partition) -> Result<(), StoreError> {
        Err(Self::unavailable())
    }
}
