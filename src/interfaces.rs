// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collaborator traits.
//!
//! The engine reaches every external system through one of these narrow
//! seams, so tests can script a source database and record indexer calls.
//!
//! | Trait | Provided by | Used for |
//! |-------|-------------|----------|
//! | [`SourceClient`] | database driver | opening scans/feeds, committed time, name resolution |
//! | [`ScanClient`] / [`FeedClient`] | database driver | paging through one cursor |
//! | [`Indexer`] | index engine | applying document events |
//! | [`IndexCommitter`] | index engine / [`CheckpointStore`](crate::checkpoint::CheckpointStore) | durable resume metadata |
//! | [`IndexingScheduler`] / [`DecodeScheduler`] | [`scheduler`](crate::scheduler) | ordered, cancelable work |
//! | [`MaterializedView`] | embedding store | diff scanning |
//! | [`ModeSelector`] | [`HeuristicModeSelector`](crate::steady_state::HeuristicModeSelector) | feed projection |
//!
//! # Example
//!
//! ```rust,no_run
//! use index_replication::interfaces::{BoxFuture, Indexer};
//! use index_replication::batch::DocumentEvent;
//! use index_replication::model::{CommitMetadata, GenerationId, Priority};
//!
//! struct NullIndexer;
//!
//! impl Indexer for NullIndexer {
//!     fn index(
//!         &self,
//!         _generation: GenerationId,
//!         _events: Vec<DocumentEvent>,
//!         _priority: Priority,
//!         _metadata: Option<CommitMetadata>,
//!     ) -> BoxFuture<'_, ()> {
//!         Box::pin(async { Ok(()) })
//!     }
//! }
//! ```

use crate::batch::{DocumentEvent, ReusedVectors};
use crate::error::{Result, SyncError};
use crate::feed::{FeedBatch, FeedEvent, RawFeedEvent};
use crate::model::{
    AttemptId, CommitMetadata, Document, DocumentKey, GenerationId, IndexDefinition, Namespace,
    Priority, ProjectionMode, ResumeToken, ScanPosition, Timestamp,
};
use futures::future::Shared;
use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Completion of one scheduled batch. Cloneable so several parties can await it.
pub type BatchFuture = Shared<BoxFuture<'static, ()>>;

// ═══════════════════════════════════════════════════════════════════════════════
// Source database
// ═══════════════════════════════════════════════════════════════════════════════

/// One page of a collection scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanPage {
    pub documents: Vec<Document>,
    /// Natural-order resume token after this page.
    pub post_batch_token: Option<ResumeToken>,
}

/// Where to open a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRequest {
    pub namespace: Namespace,
    /// Natural order: start at the token. Key order: start after the key.
    pub position: ScanPosition,
    pub preferred_host: Option<String>,
}

/// Where a feed starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStart {
    /// Inclusive operation time.
    AtOperationTime(Timestamp),
    /// Exclusive: first event after the token.
    AfterToken(ResumeToken),
}

/// Where to open a feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedRequest {
    pub namespace: Namespace,
    pub start: FeedStart,
    pub projection: ProjectionMode,
    pub preferred_host: Option<String>,
}

impl FeedRequest {
    pub fn at(namespace: Namespace, time: Timestamp) -> Self {
        Self {
            namespace,
            start: FeedStart::AtOperationTime(time),
            projection: ProjectionMode::AllFields,
            preferred_host: None,
        }
    }

    pub fn after(namespace: Namespace, token: ResumeToken) -> Self {
        Self {
            namespace,
            start: FeedStart::AfterToken(token),
            projection: ProjectionMode::AllFields,
            preferred_host: None,
        }
    }

    pub fn with_projection(mut self, projection: ProjectionMode) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_preferred_host(mut self, host: Option<String>) -> Self {
        self.preferred_host = host;
        self
    }
}

/// Sampled collection statistics, for projection-mode heuristics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CollectionStats {
    pub document_count: u64,
    pub avg_document_bytes: f64,
    pub avg_projected_bytes: f64,
}

/// Cursor over a collection scan.
pub trait ScanClient: Send {
    fn next_page(&mut self) -> BoxFuture<'_, ScanPage>;

    fn has_next(&self) -> bool;

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// Cursor over a change feed.
pub trait FeedClient: Send {
    fn next_batch(&mut self) -> BoxFuture<'_, FeedBatch>;

    fn close(&mut self) -> BoxFuture<'_, ()>;
}

/// Factory and metadata access for the source database.
pub trait SourceClient: Send + Sync + 'static {
    fn open_scan(&self, request: ScanRequest) -> BoxFuture<'_, Box<dyn ScanClient>>;

    fn open_feed(&self, request: FeedRequest) -> BoxFuture<'_, Box<dyn FeedClient>>;

    /// Latest majority-committed operation time.
    fn current_committed_time(&self) -> BoxFuture<'_, Timestamp>;

    /// Current name of the index's collection.
    ///
    /// Fails with `Dropped` when the collection no longer exists.
    fn resolve_collection_name<'a>(
        &'a self,
        definition: &'a IndexDefinition,
    ) -> BoxFuture<'a, String>;

    /// Host the client currently reads from, if it knows.
    fn sync_source_host(&self) -> Option<String> {
        None
    }

    fn collection_stats<'a>(
        &'a self,
        _namespace: &'a Namespace,
    ) -> BoxFuture<'a, Option<CollectionStats>> {
        Box::pin(async { Ok(None) })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Index engine
// ═══════════════════════════════════════════════════════════════════════════════

/// Applies document events to the index.
pub trait Indexer: Send + Sync + 'static {
    /// Index one batch. `metadata`, when present, rides along with the next
    /// commit that includes this batch.
    fn index(
        &self,
        generation: GenerationId,
        events: Vec<DocumentEvent>,
        priority: Priority,
        metadata: Option<CommitMetadata>,
    ) -> BoxFuture<'_, ()>;
}

/// Commits index state together with resume metadata.
pub trait IndexCommitter: Send + Sync + 'static {
    fn commit<'a>(
        &'a self,
        generation: &'a GenerationId,
        metadata: CommitMetadata,
    ) -> BoxFuture<'a, ()>;

    /// Metadata of the last durable commit, if any.
    fn load<'a>(&'a self, generation: &'a GenerationId) -> BoxFuture<'a, Option<CommitMetadata>>;

    /// Discard persisted metadata of a generation that will never resume.
    fn retire<'a>(&'a self, _generation: &'a GenerationId) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }
}

/// In-order, cancelable, per-generation indexing.
pub trait IndexingScheduler: Send + Sync + 'static {
    fn schedule(
        &self,
        generation: &GenerationId,
        attempt: AttemptId,
        events: Vec<DocumentEvent>,
        priority: Priority,
        metadata: Option<CommitMetadata>,
    ) -> BatchFuture;

    /// Fail queued work of `attempt` with `reason` and wait for in-flight
    /// work of the generation to finish.
    fn cancel<'a>(
        &'a self,
        generation: &'a GenerationId,
        attempt: AttemptId,
        reason: SyncError,
    ) -> BoxFuture<'a, ()>;

    /// Release bookkeeping for a generation that will schedule no more work.
    fn forget(&self, _generation: &GenerationId) {}
}

/// Receives the decoded records of a scheduled decode job.
pub type OnDecoded = Box<dyn FnOnce(Vec<FeedEvent>) -> Result<()> + Send + 'static>;

/// FIFO-per-generation decoding of raw feed records.
pub trait DecodeScheduler: Send + Sync + 'static {
    fn schedule(
        &self,
        generation: &GenerationId,
        attempt: AttemptId,
        records: Vec<RawFeedEvent>,
        priority: Priority,
        on_decoded: OnDecoded,
    ) -> BatchFuture;

    fn cancel<'a>(
        &'a self,
        generation: &'a GenerationId,
        attempt: AttemptId,
        reason: SyncError,
    ) -> BoxFuture<'a, ()>;

    /// Release bookkeeping for a generation that will schedule no more work.
    fn forget(&self, _generation: &GenerationId) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// Diff scanning and projection
// ═══════════════════════════════════════════════════════════════════════════════

/// Precomputed embedding for one field of a view entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedField {
    /// Fingerprint of the source value the vector was computed from.
    pub source_fingerprint: String,
    pub vector: Vec<f32>,
}

/// One document of the materialized view.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    pub key: DocumentKey,
    /// Fingerprint of the indexed source values at materialization time.
    pub fingerprint: String,
    pub embedded: BTreeMap<String, EmbeddedField>,
}

impl ViewEntry {
    /// Vectors whose source value is unchanged in the given fingerprints.
    pub fn reusable_vectors(&self, current: &BTreeMap<String, String>) -> ReusedVectors {
        self.embedded
            .iter()
            .filter(|(path, field)| current.get(*path) == Some(&field.source_fingerprint))
            .map(|(path, field)| (path.clone(), field.vector.clone()))
            .collect()
    }
}

/// Derived store kept in step with the collection by diffing.
pub trait MaterializedView: Send + Sync + 'static {
    /// Entries with keys in range, ascending by key.
    fn range(
        &self,
        lower: Bound<DocumentKey>,
        upper: Bound<DocumentKey>,
    ) -> BoxFuture<'_, Vec<ViewEntry>>;
}

/// Chooses the projection a generation's feed should use.
pub trait ModeSelector: Send + Sync + 'static {
    fn mode(&self, generation: &GenerationId) -> ProjectionMode;

    /// Re-sample whatever the selection depends on. Change-feed clients call
    /// this every `mode_refresh_period` while tailing.
    fn refresh<'a>(
        &'a self,
        _generation: &'a GenerationId,
        _source: &'a dyn SourceClient,
        _namespace: &'a Namespace,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Drop state for a generation that will not be tailed again.
    fn forget(&self, _generation: &GenerationId) {}
}

/// Always the default projection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedModeSelector(pub ProjectionMode);

impl ModeSelector for FixedModeSelector {
    fn mode(&self, _generation: &GenerationId) -> ProjectionMode {
        self.0
    }
}
