//! # Index Replication
//!
//! Keeps a search index in step with a live source collection: an initial
//! sync copies the collection while tailing its change feed, then steady
//! state tails the feed for as long as the index generation lives.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           index-replication                               │
//! │                                                                           │
//! │  ┌────────────────────┐  commit(change feed    ┌──────────────────────┐   │
//! │  │ InitialSyncManager │──resume info)─────────►│ IndexCommitter       │   │
//! │  │ scan ⇄ catch up    │                        │ (CheckpointStore)    │   │
//! │  └─────────┬──────────┘                        └──────────────────────┘   │
//! │            │ resume info                                  ▲               │
//! │            ▼                                              │ metadata      │
//! │  ┌────────────────────┐   ┌──────────────┐    ┌───────────┴──────────┐    │
//! │  │ ChangeFeedManager  │──►│ IndexManager │───►│ IndexingScheduler    │    │
//! │  │ (dispatch pool)    │   │ (per gen.)   │    │ (WorkQueue + Indexer)│    │
//! │  └────────────────────┘   └──────────────┘    └──────────────────────┘    │
//! │            ▲                                                              │
//! │            │ SourceClient (scan / change feed / committed time)           │
//! └────────────┼──────────────────────────────────────────────────────────────┘
//!              │
//!        source database
//! ```
//!
//! ## Two Phases
//!
//! 1. **Initial sync**: a bounded scan round, then a catch-up of the change
//!    feed to the time the round ended, repeated until the collection is
//!    exhausted. The first commit carries the feed position steady state
//!    starts from.
//! 2. **Steady state**: one dispatch loop per generation fetches feed
//!    batches, schedules their document mutations and publishes the
//!    position of every indexed batch.
//!
//! Collaborators (source database, indexer, committer) are traits in
//! [`interfaces`]; the in-process [`scheduler`]s and the SQLite
//! [`checkpoint`] store implement the scheduling and persistence contracts.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use index_replication::{
//!     ChangeFeedManager, CheckpointStore, HeuristicModeSelector, IndexDefinition,
//!     IndexingWorkScheduler, InitialSyncManager, ReplicationConfig, GenerationId,
//! };
//! use index_replication::interfaces::{Indexer, SourceClient};
//! use std::sync::Arc;
//!
//! async fn run(
//!     source: Arc<dyn SourceClient>,
//!     indexer: Arc<dyn Indexer>,
//!     definition: IndexDefinition,
//! ) -> index_replication::Result<()> {
//!     let config = ReplicationConfig::default();
//!     let store = Arc::new(CheckpointStore::open(&config.checkpoint).await?);
//!     let scheduler = Arc::new(IndexingWorkScheduler::new(
//!         indexer,
//!         config.scheduler.num_indexing_workers,
//!     ));
//!     let generation = GenerationId::new(definition.index_id.clone(), 1);
//!
//!     let sync = InitialSyncManager::new(
//!         &config,
//!         generation.clone(),
//!         definition.clone(),
//!         Arc::clone(&source),
//!         scheduler.clone(),
//!         store,
//!     );
//!     let resume = sync.run(None).await?;
//!
//!     let feeds = ChangeFeedManager::new(
//!         &config,
//!         source,
//!         scheduler,
//!         Arc::new(HeuristicModeSelector::new()),
//!     );
//!     let mut lifecycle = feeds.add(definition, generation, resume).await?;
//!     let cause = lifecycle.wait().await;
//!     tracing::info!(cause = %cause, "Generation finished");
//!     feeds.shutdown().await
//! }
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod feed;
pub mod initial_sync;
pub mod interfaces;
pub mod metrics;
pub mod model;
pub mod resilience;
pub mod scheduler;
pub mod steady_state;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use batch::{DocumentEvent, DocumentEventBatch, DocumentEventKind};
pub use checkpoint::CheckpointStore;
pub use config::{
    CheckpointConfig, InitialSyncConfig, ReplicationConfig, SchedulerConfig, SteadyStateConfig,
    SyncSourcePolicy,
};
pub use error::{Result, SyncError, SyncErrorKind};
pub use feed::{FeedBatch, FeedEvent, LifecycleEvent, OperationType, RawFeedEvent};
pub use initial_sync::{InitialSyncManager, InitialSyncPhase};
pub use model::{
    CommitMetadata, DocumentKey, FeedResumeInfo, GenerationId, IndexDefinition, IndexKind,
    IndexMapping, InitialSyncResumeInfo, Namespace, ProjectionMode, ResumeInfo, ResumeToken,
    ScanMode, ScanPosition, Timestamp,
};
pub use scheduler::{DecodingWorkScheduler, IndexingWorkScheduler, WorkQueue};
pub use steady_state::{ChangeFeedManager, HeuristicModeSelector, LifecycleHandle};
