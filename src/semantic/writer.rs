//! Ordered background persistence.
//!
//! Every write to the vector store goes through one FIFO chain of tasks, so a
//! delete issued after a set is applied after it. Failures are logged, never
//! returned: the in-memory maps are the source of truth for the process.
//!
//! Called outside a tokio runtime, a write is applied on the caller's thread
//! instead.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::semantic::storage::{Partition, StoreError, VectorStore};
use crate::semantic::Vector;

#[derive(Debug)]
enum WriteOp {
    Set {
        partition: Partition,
        key: String,
        vector: Vector,
    },
    Delete {
        partition: Partition,
        key: String,
    },
    Clear(Partition),
}

impl WriteOp {
    fn apply(&self, store: &dyn VectorStore) -> Result<(), StoreError> {
        match self {
            WriteOp::Set {
                partition,
                key,
                vector,
            } => store.set(*partition, key, vector),
            WriteOp::Delete { partition, key } => store.delete(*partition, key),
            WriteOp::Clear(partition) => store.clear(*partition),
        }
    }

    fn describe(&self) -> String {
        match self {
            WriteOp::Set { partition, key, .. } => format!("save {}/{}", partition.name(), key),
            WriteOp::Delete { partition, key } => format!("delete {}/{}", partition.name(), key),
            WriteOp::Clear(partition) => format!("clear {}", partition.name()),
        }
    }
}

pub struct StoreWriter {
    store: Arc<dyn VectorStore>,
    /// Last task in the chain
    tail: Mutex<Option<JoinHandle<()>>>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn VectorStore>) -> Self {
        Self {
            store,
            tail: Mutex::new(None),
        }
    }

    /// The underlying store, for reads.
    pub fn store(&self) -> Arc<dyn VectorStore> {
        Arc::clone(&self.store)
    }

    pub fn set(&self, partition: Partition, key: String, vector: Vector) {
        self.submit(WriteOp::Set {
            partition,
            key,
            vector,
        });
    }

    pub fn delete(&self, partition: Partition, key: String) {
        self.submit(WriteOp::Delete { partition, key });
    }

    pub fn clear(&self, partition: Partition) {
        self.submit(WriteOp::Clear(partition));
    }

    /// Wait until every write submitted before this call has been applied.
    pub async fn flush(&self) {
        let Ok(handle) = Handle::try_current() else {
            return;
        };
        let (tx, rx) = oneshot::channel();
        self.chain(&handle, async move {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }

    fn submit(&self, op: WriteOp) {
        let Ok(handle) = Handle::try_current() else {
            // hold the tail so no queued write interleaves
            let _tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
            log_outcome(&op.describe(), op.apply(self.store.as_ref()));
            return;
        };

        let store = Arc::clone(&self.store);
        self.chain(&handle, async move {
            let description = op.describe();
            match tokio::task::spawn_blocking(move || op.apply(store.as_ref())).await {
                Ok(result) => log_outcome(&description, result),
                Err(e) => log::warn!("Failed to {}: {}", description, e),
            }
        });
    }

    fn chain<F>(&self, handle: &Handle, next: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = tail.take();
        *tail = Some(handle.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            next.await;
        }));
    }
}

fn log_outcome(description: &str, result: Result<(), StoreError>) {
    match result {
        Ok(()) => log::debug!("Persisted: {}", description),
        Err(e) => log::warn!("Failed to {}: {}", description, e),
    }
}
