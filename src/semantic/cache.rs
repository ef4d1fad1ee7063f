//! Content-addressed vector cache.
//!
//! Maps a text fingerprint to its embedding so repeated requests for the same
//! text never reach the provider twice. The in-memory map is authoritative;
//! the store is a best-effort mirror written in the background.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::semantic::embeddings::{EmbeddingError, ModelLoader};
use crate::semantic::preprocess::Fingerprint;
use crate::semantic::storage::Partition;
use crate::semantic::writer::StoreWriter;
use crate::semantic::Vector;

#[derive(Default)]
struct CacheState {
    entries: HashMap<Fingerprint, Vector>,
    /// Insertion order, oldest first
    order: VecDeque<Fingerprint>,
}

impl CacheState {
    /// Insert a new entry and return the fingerprints evicted to stay within
    /// `max_entries` (0 = unbounded).
    fn insert(&mut self, fingerprint: Fingerprint, vector: Vector, max_entries: usize) -> Vec<Fingerprint> {
        if self.entries.insert(fingerprint, vector).is_none() {
            self.order.push_back(fingerprint);
        }

        let mut evicted = Vec::new();
        if max_entries == 0 {
            return evicted;
        }

        while self.entries.len() > max_entries {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.entries.remove(&oldest).is_some() {
                evicted.push(oldest);
            }
        }
        evicted
    }
}

pub struct VectorCache {
    loader: Arc<ModelLoader>,
    writer: Arc<StoreWriter>,
    state: RwLock<CacheState>,
    max_entries: usize,
}

impl VectorCache {
    /// Create an empty cache. `max_entries` of 0 disables eviction.
    pub fn new(loader: Arc<ModelLoader>, writer: Arc<StoreWriter>, max_entries: usize) -> Self {
        Self {
            loader,
            writer,
            state: RwLock::new(CacheState::default()),
            max_entries,
        }
    }

    /// Number of cached vectors.
    pub fn len(&self) -> usize {
        self.read_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached vector for the exact text, if any. Never computes.
    pub fn get(&self, text: &str) -> Option<Vector> {
        self.read_state().entries.get(&Fingerprint::of(text)).cloned()
    }

    /// Return the vector for `text`, computing it through the provider on a
    /// cache miss.
    ///
    /// Cache hits do no I/O and do not load the model. Provider failures are
    /// returned as-is; there is no retry here. The new entry is persisted in
    /// the background.
    pub async fn get_or_compute(&self, text: &str) -> Result<Vector, EmbeddingError> {
        let fingerprint = Fingerprint::of(text);

        let cached = self.read_state().entries.get(&fingerprint).cloned();
        if let Some(vector) = cached {
            return Ok(vector);
        }

        let provider = self.loader.get().await?;
        let vector = provider.embed(text).await?;

        if vector.len() != provider.dimensions() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: provider.dimensions(),
                got: vector.len(),
            });
        }

        let evicted = self
            .write_state()
            .insert(fingerprint, vector.clone(), self.max_entries);

        self.writer
            .set(Partition::EmbeddingsCache, fingerprint.to_key(), vector.clone());
        for fingerprint in evicted {
            log::debug!("Evicting cached embedding {}", fingerprint);
            self.writer
                .delete(Partition::EmbeddingsCache, fingerprint.to_key());
        }

        Ok(vector)
    }

    /// Read all persisted entries into memory.
    ///
    /// Failure is logged and leaves the cache as it was.
    pub async fn load(&self) {
        let store = self.writer.store();
        let loaded = tokio::task::spawn_blocking(move || store.entries(Partition::EmbeddingsCache)).await;

        let entries = match loaded {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                log::warn!("Failed to load embedding cache: {}", e);
                return;
            }
            Err(e) => {
                log::warn!("Failed to load embedding cache: {}", e);
                return;
            }
        };

        let mut loaded_count = 0usize;
        let mut evicted = Vec::new();
        {
            let mut state = self.write_state();
            for (key, vector) in entries {
                let Ok(fingerprint) = key.parse::<Fingerprint>() else {
                    log::warn!("Ignoring cached embedding with malformed key {:?}", key);
                    continue;
                };
                if state.entries.contains_key(&fingerprint) {
                    continue;
                }
                evicted.extend(state.insert(fingerprint, vector, self.max_entries));
                loaded_count += 1;
            }
        }

        for fingerprint in evicted {
            self.writer
                .delete(Partition::EmbeddingsCache, fingerprint.to_key());
        }

        log::info!("Loaded {} cached embeddings", loaded_count);
    }

    /// Drop vectors whose length differs from `dimensions`.
    /// Returns the number of entries dropped.
    pub fn retain_dimensions(&self, dimensions: usize) -> usize {
        let stale: Vec<Fingerprint> = {
            let mut state = self.write_state();
            let stale: Vec<Fingerprint> = state
                .entries
                .iter()
                .filter(|(_, v)| v.len() != dimensions)
                .map(|(fp, _)| *fp)
                .collect();
            for fingerprint in &stale {
                state.entries.remove(fingerprint);
            }
            state.order.retain(|fp| !stale.contains(fp));
            stale
        };

        for fingerprint in &stale {
            self.writer
                .delete(Partition::EmbeddingsCache, fingerprint.to_key());
        }
        stale.len()
    }

    /// Wipe the in-memory map and the persisted partition.
    pub fn clear(&self) {
        {
            let mut state = self.write_state();
            state.entries.clear();
            state.order.clear();
        }
        self.writer.clear(Partition::EmbeddingsCache);
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
