//! Bulk population of the note index.
//!
//! Notes are embedded in small batches: the notes of one batch run
//! concurrently, and a batch must settle before the next one starts.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::notes::NoteRecord;
use crate::semantic::index::{NoteVectorIndex, UpsertOutcome};

/// Default number of notes embedded concurrently
pub const DEFAULT_BATCH_SIZE: usize = 3;

/// Default pause between batches
pub const DEFAULT_BATCH_PAUSE: Duration = Duration::from_millis(100);

/// Summary of one `process_all` run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    /// Already in the index, not recomputed
    pub skipped: usize,
    pub embedded: usize,
    /// Another caller was embedding the note at the same time
    pub in_flight: usize,
    pub failed: usize,
}

pub struct BatchProcessor {
    index: Arc<NoteVectorIndex>,
    batch_size: usize,
    pause: Duration,
}

impl BatchProcessor {
    pub fn new(index: Arc<NoteVectorIndex>, batch_size: usize, pause: Duration) -> Self {
        Self {
            index,
            batch_size: batch_size.max(1),
            pause,
        }
    }

    /// Embed every note that is not yet in the index.
    ///
    /// Presence is all that is checked: a note whose content changed since
    /// it was indexed is not recomputed here. A failing note is logged and
    /// left out; it will be retried on the next call.
    pub async fn process_all<N>(&self, notes: &[N]) -> BatchReport
    where
        N: NoteRecord + Clone + Send + Sync + 'static,
    {
        log::info!("Processing embeddings for {} notes...", notes.len());

        let mut report = BatchReport {
            total: notes.len(),
            ..Default::default()
        };

        let batch_count = notes.len().div_ceil(self.batch_size);
        for (batch_idx, batch) in notes.chunks(self.batch_size).enumerate() {
            let mut tasks = JoinSet::new();

            for note in batch {
                if self.index.has(note.id()) {
                    report.skipped += 1;
                    continue;
                }

                let index = Arc::clone(&self.index);
                let note = note.clone();
                tasks.spawn(async move {
                    let result = index.upsert(&note).await;
                    (note.id(), result)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((_, Ok(UpsertOutcome::Stored))) => report.embedded += 1,
                    Ok((_, Ok(UpsertOutcome::AlreadyInFlight))) => report.in_flight += 1,
                    Ok((id, Err(e))) => {
                        log::warn!("Failed to process embedding for note {}: {}", id, e);
                        report.failed += 1;
                    }
                    Err(e) => {
                        log::error!("Embedding task panicked: {}", e);
                        report.failed += 1;
                    }
                }
            }

            if batch_idx + 1 < batch_count && !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }

        log::info!(
            "Finished processing {} notes ({} embedded, {} skipped, {} failed). Total embeddings: {}",
            report.total,
            report.embedded,
            report.skipped,
            report.failed,
            self.index.len()
        );

        report
    }
}
