//! Recording `Indexer` for integration tests.
//!
//! Records every batch, and when given a checkpoint store commits the
//! batch's resume metadata after "indexing" it, the way a real index engine
//! commits metadata together with the data it covers.

use index_replication::batch::DocumentEvent;
use index_replication::checkpoint::CheckpointStore;
use index_replication::error::SyncError;
use index_replication::interfaces::{BoxFuture, IndexCommitter, Indexer};
use index_replication::model::{CommitMetadata, DocumentKey, GenerationId, Priority};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One `index()` call.
#[derive(Debug, Clone)]
pub struct IndexedBatch {
    pub generation: GenerationId,
    pub events: Vec<DocumentEvent>,
    pub priority: Priority,
    pub metadata: Option<CommitMetadata>,
}

pub struct RecordingIndexer {
    batches: Mutex<Vec<IndexedBatch>>,
    committed: Mutex<Vec<CommitMetadata>>,
    store: Option<Arc<CheckpointStore>>,
    /// Fail every call once this many batches were indexed.
    fail_after: AtomicUsize,
    /// Never resolve.
    stall: AtomicBool,
    calls: AtomicUsize,
}

impl RecordingIndexer {
    pub fn new() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            store: None,
            fail_after: AtomicUsize::new(usize::MAX),
            stall: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_store(store: Arc<CheckpointStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    pub fn stalling() -> Self {
        let indexer = Self::new();
        indexer.stall.store(true, Ordering::SeqCst);
        indexer
    }

    pub fn fail_after(&self, batches: usize) {
        self.fail_after.store(batches, Ordering::SeqCst);
    }

    pub fn batches(&self) -> Vec<IndexedBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<DocumentEvent> {
        self.batches().into_iter().flat_map(|b| b.events).collect()
    }

    pub fn keys(&self) -> Vec<DocumentKey> {
        self.events().into_iter().map(|e| e.key).collect()
    }

    /// Metadata of every commit, in commit order.
    pub fn committed(&self) -> Vec<CommitMetadata> {
        self.committed.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Indexer for RecordingIndexer {
    fn index(
        &self,
        generation: GenerationId,
        events: Vec<DocumentEvent>,
        priority: Priority,
        metadata: Option<CommitMetadata>,
    ) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.stall.load(Ordering::SeqCst) {
                futures::future::pending::<()>().await;
            }
            if self.batches.lock().unwrap().len() >= self.fail_after.load(Ordering::SeqCst) {
                return Err(SyncError::transient("index engine unavailable"));
            }
            self.batches.lock().unwrap().push(IndexedBatch {
                generation: generation.clone(),
                events,
                priority,
                metadata: metadata.clone(),
            });
            if let Some(metadata) = metadata {
                if let Some(store) = &self.store {
                    if store.commit_metadata(&generation, metadata.clone()).await? {
                        self.committed.lock().unwrap().push(metadata);
                    }
                } else {
                    self.committed.lock().unwrap().push(metadata);
                }
            }
            Ok(())
        })
    }
}

/// Committer without I/O, for tests running on a paused clock.
#[derive(Default)]
pub struct MemoryCommitter {
    commits: Mutex<HashMap<GenerationId, CommitMetadata>>,
}

impl MemoryCommitter {
    pub fn get(&self, generation: &GenerationId) -> Option<CommitMetadata> {
        self.commits.lock().unwrap().get(generation).cloned()
    }
}

impl IndexCommitter for MemoryCommitter {
    fn commit<'a>(
        &'a self,
        generation: &'a GenerationId,
        metadata: CommitMetadata,
    ) -> BoxFuture<'a, ()> {
        self.commits
            .lock()
            .unwrap()
            .insert(generation.clone(), metadata);
        Box::pin(async { Ok(()) })
    }

    fn load<'a>(&'a self, generation: &'a GenerationId) -> BoxFuture<'a, Option<CommitMetadata>> {
        let metadata = self.get(generation);
        Box::pin(async move { Ok(metadata) })
    }
}
