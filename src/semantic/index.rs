//! In-memory note vector index.
//!
//! Stores the current embedding of each note, keyed by note id, and tracks
//! which notes are being embedded right now so the same note is never
//! computed twice concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::notes::{NoteId, NoteRecord};
use crate::semantic::cache::VectorCache;
use crate::semantic::embeddings::EmbeddingError;
use crate::semantic::preprocess::compose_note_text;
use crate::semantic::storage::Partition;
use crate::semantic::writer::StoreWriter;
use crate::semantic::Vector;

/// What an `upsert` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The note's vector was computed (or taken from the cache) and stored
    Stored,
    /// Another upsert of the same note was already running; nothing was done
    AlreadyInFlight,
}

/// Removes a note id from the in-flight set when dropped, whether the
/// upsert finished, failed or was cancelled.
struct InFlightGuard<'a> {
    in_flight: &'a Mutex<HashSet<NoteId>>,
    id: NoteId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Note id -> embedding, backed by the `note_embeddings` partition.
pub struct NoteVectorIndex {
    cache: Arc<VectorCache>,
    writer: Arc<StoreWriter>,
    entries: RwLock<HashMap<NoteId, Vector>>,
    in_flight: Mutex<HashSet<NoteId>>,
}

impl NoteVectorIndex {
    pub fn new(cache: Arc<VectorCache>, writer: Arc<StoreWriter>) -> Self {
        Self {
            cache,
            writer,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Check if the note has a vector. No I/O.
    pub fn has(&self, id: NoteId) -> bool {
        self.read_entries().contains_key(&id)
    }

    /// Get the vector of a note.
    pub fn get(&self, id: NoteId) -> Option<Vector> {
        self.read_entries().get(&id).cloned()
    }

    /// Get the number of indexed notes.
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of notes currently being embedded.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Embed a note and store its vector.
    ///
    /// Returns immediately with `AlreadyInFlight` if an upsert for the same
    /// note is still running. Embedding failures are returned to the caller;
    /// persistence happens in the background and never fails the call.
    pub async fn upsert<N: NoteRecord + ?Sized>(
        &self,
        note: &N,
    ) -> Result<UpsertOutcome, EmbeddingError> {
        let id = note.id();
        let Some(_guard) = self.try_mark_in_flight(id) else {
            log::debug!("Note {} is already being embedded", id);
            return Ok(UpsertOutcome::AlreadyInFlight);
        };

        let text = compose_note_text(note.title(), note.content());
        let vector = self.cache.get_or_compute(&text).await?;

        self.write_entries().insert(id, vector.clone());
        self.writer
            .set(Partition::NoteEmbeddings, id.to_string(), vector);

        log::debug!("Stored embedding for note {}", id);
        Ok(UpsertOutcome::Stored)
    }

    /// Remove a note's vector. Removing an absent note is a no-op.
    pub fn remove(&self, id: NoteId) {
        let removed = self.write_entries().remove(&id).is_some();
        if removed {
            log::debug!("Removed embedding for note {}", id);
        }
        self.writer.delete(Partition::NoteEmbeddings, id.to_string());
    }

    /// Read all persisted note vectors into memory.
    ///
    /// Failure is logged and leaves the index as it was. Keys that are not
    /// note ids are skipped.
    pub async fn load(&self) {
        let store = self.writer.store();
        let loaded = tokio::task::spawn_blocking(move || store.entries(Partition::NoteEmbeddings)).await;

        let entries = match loaded {
            Ok(Ok(entries)) => entries,
            Ok(Err(e)) => {
                log::warn!("Failed to load note embeddings: {}", e);
                return;
            }
            Err(e) => {
                log::warn!("Failed to load note embeddings: {}", e);
                return;
            }
        };

        let mut map = self.write_entries();
        let mut loaded_count = 0usize;
        for (key, vector) in entries {
            match key.parse::<NoteId>() {
                Ok(id) => {
                    map.entry(id).or_insert(vector);
                    loaded_count += 1;
                }
                Err(_) => log::warn!("Ignoring note embedding with malformed key {:?}", key),
            }
        }

        log::info!("Loaded {} note embeddings from storage", loaded_count);
    }

    /// Drop vectors whose length differs from `dimensions`, e.g. after the
    /// embedding model changed. Returns the number of notes dropped.
    pub fn retain_dimensions(&self, dimensions: usize) -> usize {
        let stale: Vec<NoteId> = {
            let mut map = self.write_entries();
            let stale: Vec<NoteId> = map
                .iter()
                .filter(|(_, v)| v.len() != dimensions)
                .map(|(id, _)| *id)
                .collect();
            for id in &stale {
                map.remove(id);
            }
            stale
        };

        for id in &stale {
            self.writer.delete(Partition::NoteEmbeddings, id.to_string());
        }
        stale.len()
    }

    /// Clear all note vectors from memory and storage.
    pub fn clear(&self) {
        self.write_entries().clear();
        self.writer.clear(Partition::NoteEmbeddings);
    }

    fn try_mark_in_flight(&self, id: NoteId) -> Option<InFlightGuard<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(id) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: &self.in_flight,
            id,
        })
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, HashMap<NoteId, Vector>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, HashMap<NoteId, Vector>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}
