// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Initial sync: scan the collection while tailing its change feed, then hand
//! a feed position to steady state.
//!
//! # Architecture
//!
//! ```text
//!                  InitialSyncManager::run(resume)
//!                              │
//!           ┌──────────────────┴───────────────────┐
//!           │ start point: committed? resume? fresh │
//!           └──────────────────┬───────────────────┘
//!                              ▼
//!    ┌──────────────── scan round (budget) ◀──────────────┐
//!    │      CollectionScanner ──▶ IndexingScheduler         │ more_to_scan
//!    │                             (InitialSyncScan)        │
//!    ▼                                                      │
//!  stop_at = current_committed_time()                       │
//!    │                                                      │
//!    ▼                                                      │
//!  ChangeFeedApplier::apply(position, stop_at) ─────────────┘
//!    │    (InitialSyncChangeFeed)
//!    │ collection exhausted: reduce lag, then
//!    ▼
//!  IndexCommitter::commit(change_feed resume info)
//! ```
//!
//! # Resume Semantics
//!
//! - Fresh start: the scan begins at the collection start and the feed opens
//!   just after the committed time observed at start.
//! - Resume: the scan continues after the persisted position and the feed
//!   reopens *at* the persisted high-water mark, inclusively, so a
//!   transaction straddling the mark is replayed rather than lost.
//! - Already committed: the persisted feed position is returned as-is.
//!
//! # Cancellation
//!
//! [`InitialSyncManager::shutdown`] flips a watch flag. The running scan or
//! apply sub-phase notices it at its next iteration boundary, cancels the
//! attempt's scheduled work and drains it. The manager waits for that drain
//! for the index kind's shutdown timeout; a drain that overruns surfaces as
//! `Transient`.

mod applier;
mod context;
mod diff_scanner;
mod scanner;
mod types;

pub use diff_scanner::{
    diff_sorted, document_fingerprint, embedded_fingerprints, field_fingerprint, DiffPage,
    DiffScanner,
};
pub use types::InitialSyncPhase;

use crate::config::{InitialSyncConfig, ReplicationConfig, SyncSourcePolicy};
use crate::error::{Result, SyncError};
use crate::interfaces::{IndexCommitter, IndexingScheduler, MaterializedView, SourceClient};
use crate::metrics;
use crate::model::{
    AttemptId, CommitMetadata, FeedResumeInfo, GenerationId, IndexDefinition,
    InitialSyncResumeInfo, ResumeInfo, ScanMode, ScanPosition,
};
use crate::resilience::RateLimitedWarn;
use applier::ChangeFeedApplier;
use context::{publish_phase, SyncContext};
use scanner::CollectionScanner;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};

/// Where an attempt starts.
enum StartPoint {
    /// The first commit already happened.
    Committed(FeedResumeInfo),
    Fresh,
    Resume(InitialSyncResumeInfo),
}

/// Drives one initial sync attempt for one index generation.
pub struct InitialSyncManager {
    config: InitialSyncConfig,
    generation: GenerationId,
    definition: IndexDefinition,
    source: Arc<dyn SourceClient>,
    scheduler: Arc<dyn IndexingScheduler>,
    committer: Arc<dyn IndexCommitter>,
    view: Option<Arc<dyn MaterializedView>>,
    skipped_warn: Arc<RateLimitedWarn>,
    shutdown_tx: watch::Sender<bool>,
    phase: Arc<watch::Sender<InitialSyncPhase>>,
}

impl InitialSyncManager {
    pub fn new(
        config: &ReplicationConfig,
        generation: GenerationId,
        definition: IndexDefinition,
        source: Arc<dyn SourceClient>,
        scheduler: Arc<dyn IndexingScheduler>,
        committer: Arc<dyn IndexCommitter>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (phase, _) = watch::channel(InitialSyncPhase::default());
        Self {
            config: config.initial_sync.clone(),
            generation,
            definition,
            source,
            scheduler,
            committer,
            view: None,
            skipped_warn: Arc::new(RateLimitedWarn::new(config.skipped_record_warn_interval())),
            shutdown_tx,
            phase: Arc::new(phase),
        }
    }

    /// Diff against a materialized view instead of re-indexing every page.
    ///
    /// Only key-order scans can be diffed; natural-order indexes ignore it.
    pub fn with_materialized_view(mut self, view: Arc<dyn MaterializedView>) -> Self {
        self.view = Some(view);
        self
    }

    /// Observe phase transitions.
    pub fn phase(&self) -> watch::Receiver<InitialSyncPhase> {
        self.phase.subscribe()
    }

    /// Request cooperative cancellation of a running attempt.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Run the attempt to its first commit.
    ///
    /// `resume` overrides whatever the committer has persisted. Returns the
    /// feed position steady state should resume from.
    pub async fn run(&self, resume: Option<InitialSyncResumeInfo>) -> Result<FeedResumeInfo> {
        let span = info_span!(
            "initial_sync",
            index_id = %self.generation.index_id,
            generation = self.generation.generation
        );

        async move {
            info!(namespace = %self.definition.namespace(), scan_mode = %self.definition.scan_mode, "Starting initial sync");
            let result = self.sync(resume).await;
            self.scheduler.forget(&self.generation);
            match &result {
                Ok(info) => {
                    self.set_phase(InitialSyncPhase::Committed);
                    info!(operation_time = %info.operation_time, "Initial sync committed");
                }
                Err(e) => {
                    self.set_phase(InitialSyncPhase::Failed);
                    metrics::record_sync_error(&self.generation.index_id, "initial_sync", e.kind().as_str());
                    if e.is_shutdown() {
                        info!("Initial sync shut down");
                    } else {
                        warn!(error = %e, "Initial sync failed");
                    }
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    fn set_phase(&self, phase: InitialSyncPhase) {
        publish_phase(&self.phase, &self.generation.index_id, phase);
    }

    async fn start_point(&self, resume: Option<InitialSyncResumeInfo>) -> Result<StartPoint> {
        let resume = match resume {
            Some(info) => Some(info),
            None => match self.committer.load(&self.generation).await? {
                Some(CommitMetadata {
                    change_feed: Some(feed),
                    ..
                }) => return Ok(StartPoint::Committed(feed)),
                Some(metadata) => metadata.initial_sync,
                None => None,
            },
        };

        match resume {
            Some(info) if info.scan_mode() != self.definition.scan_mode => {
                warn!(
                    persisted = %info.scan_mode(),
                    requested = %self.definition.scan_mode,
                    "Resume info was written by a different scan mode"
                );
                Err(SyncError::Invalidated(ResumeInfo::InitialSync(info)))
            }
            Some(info) => Ok(StartPoint::Resume(info)),
            None => Ok(StartPoint::Fresh),
        }
    }

    async fn sync(&self, resume: Option<InitialSyncResumeInfo>) -> Result<FeedResumeInfo> {
        self.set_phase(InitialSyncPhase::ResumingOrFresh);
        let resume = match self.start_point(resume).await? {
            StartPoint::Committed(info) => {
                info!(operation_time = %info.operation_time, "Initial sync already committed");
                return Ok(info);
            }
            StartPoint::Fresh => None,
            StartPoint::Resume(info) => Some(info),
        };

        let sync_source_host = match self.config.sync_source_policy {
            SyncSourcePolicy::Pinned => resume
                .as_ref()
                .and_then(|info| info.sync_source_host.clone())
                .or_else(|| self.source.sync_source_host()),
            SyncSourcePolicy::Rebalance => None,
        };

        // Resume reopens the feed at the mark; a fresh start opens just after "now".
        let (high_water_mark, position, start_at) = match resume {
            Some(info) => {
                info!(
                    high_water_mark = %info.high_water_mark,
                    last_scanned = ?info.last_scanned,
                    "Resuming initial sync"
                );
                (info.high_water_mark, info.last_scanned, info.high_water_mark)
            }
            None => {
                let now = self.source.current_committed_time().await?;
                debug!(committed = %now, "Fresh initial sync");
                (now, ScanPosition::start(self.definition.scan_mode), now.next_tick())
            }
        };

        let diff = match (&self.view, self.definition.scan_mode) {
            (Some(view), ScanMode::KeyOrder) => Some(DiffScanner::new(
                Arc::clone(view),
                self.definition.mapping.clone(),
            )),
            (Some(_), ScanMode::NaturalOrder) => {
                warn!("Diff scanning needs a key-order scan, falling back to a full scan");
                None
            }
            (None, _) => None,
        };

        let ctx = SyncContext {
            generation: self.generation.clone(),
            attempt: AttemptId::next(),
            definition: self.definition.clone(),
            namespace: self.definition.namespace(),
            source: Arc::clone(&self.source),
            scheduler: Arc::clone(&self.scheduler),
            skipped_warn: Arc::clone(&self.skipped_warn),
            sync_source_host,
            shutdown: self.shutdown_tx.subscribe(),
            phase: Arc::clone(&self.phase),
        };

        let mut scanner = CollectionScanner::new(&ctx, position, diff);
        let mut applier = ChangeFeedApplier::new(
            &ctx,
            start_at,
            high_water_mark,
            self.config.catchup_timeout(),
            self.config.max_lag(),
        );

        let result = self.scan_and_tail(&ctx, &mut scanner, &mut applier).await;
        if let Err(e) = applier.close().await {
            debug!(error = %e, "Failed to close initial sync change feed");
        }
        let info = result?;

        ctx.set_phase(InitialSyncPhase::Committing);
        self.committer
            .commit(&self.generation, CommitMetadata::change_feed(info.clone()))
            .await
            .map_err(|e| {
                if self.is_shutting_down() {
                    SyncError::ShutDown
                } else {
                    SyncError::transient(format!("first commit failed: {e}"))
                }
            })?;
        Ok(info)
    }

    async fn scan_and_tail(
        &self,
        ctx: &SyncContext,
        scanner: &mut CollectionScanner<'_>,
        applier: &mut ChangeFeedApplier<'_>,
    ) -> Result<FeedResumeInfo> {
        let budget = self.config.collection_scan_time();
        loop {
            ctx.set_phase(InitialSyncPhase::Scanning);
            let outcome = self
                .bounded(scanner.scan(budget, applier.high_water_mark()))
                .await?;

            let stop_at = ctx.source.current_committed_time().await?;
            ctx.set_phase(InitialSyncPhase::CatchingUp);
            let high_water_mark = self
                .bounded(applier.apply(&outcome.position, stop_at, !outcome.more_to_scan))
                .await?;
            debug!(
                high_water_mark = %high_water_mark,
                more_to_scan = outcome.more_to_scan,
                "Scan round caught up"
            );

            if !outcome.more_to_scan {
                break;
            }
        }

        applier
            .resume_info()
            .ok_or_else(|| SyncError::transient("change feed produced no resume position"))
    }

    /// Await a sub-phase; once shutdown is requested, give it the drain
    /// timeout to unwind.
    async fn bounded<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::pin!(fut);

        tokio::select! {
            biased;
            result = &mut fut => return result,
            _ = shutdown_rx.wait_for(|shutting_down| *shutting_down) => {}
        }

        let timeout = self.config.shutdown_timeout(self.definition.kind);
        info!(timeout = ?timeout, "Shutdown requested, draining initial sync");
        match tokio::time::timeout(timeout, fut).await {
            Ok(_) => Err(SyncError::ShutDown),
            Err(_) => Err(SyncError::transient(format!(
                "timed out after {timeout:?} draining initial sync work"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::config::CheckpointConfig;
    use crate::feed::FeedEvent;
    use crate::interfaces::{BoxFuture, FeedStart};
    use crate::model::{DocumentKey, IndexMapping, Priority, ResumeToken, Timestamp};
    use crate::test_support::{doc, ns, RecordingScheduler, ScriptedSource};
    use serde_json::json;

    fn ts(s: u32) -> Timestamp {
        Timestamp::new(s, 0)
    }

    fn definition() -> IndexDefinition {
        IndexDefinition::new("idx", &ns(), IndexMapping::dynamic())
    }

    async fn manager(
        source: &ScriptedSource,
        scheduler: &Arc<RecordingScheduler>,
    ) -> (InitialSyncManager, Arc<CheckpointStore>) {
        let store = Arc::new(CheckpointStore::open(&CheckpointConfig::in_memory()).await.unwrap());
        let manager = InitialSyncManager::new(
            &ReplicationConfig::for_testing(),
            GenerationId::new("idx", 1),
            definition(),
            Arc::new(source.clone()),
            scheduler.clone(),
            store.clone(),
        );
        (manager, store)
    }

    #[tokio::test]
    async fn test_fresh_sync_scans_tails_and_commits() {
        let source = ScriptedSource::new(ts(10))
            .with_pages(vec![vec![doc(json!({"_id": 1})), doc(json!({"_id": 2}))]]);
        source.push_feed(&[FeedEvent::delete("t1", ts(11), &ns(), DocumentKey::Int(1))], "pb1", ts(11));
        let scheduler = Arc::new(RecordingScheduler::default());
        let (manager, store) = manager(&source, &scheduler).await;

        let info = manager.run(None).await.unwrap();

        assert_eq!(info.resume_token, ResumeToken::new("pb1"));
        assert_eq!(info.operation_time, ts(11));
        assert_eq!(*manager.phase().borrow(), InitialSyncPhase::Committed);

        let batches = scheduler.batches();
        assert_eq!(batches[0].priority, Priority::InitialSyncScan);
        assert_eq!(batches[1].priority, Priority::InitialSyncChangeFeed);
        assert_eq!(
            source.feed_requests()[0].start,
            FeedStart::AtOperationTime(ts(10).next_tick())
        );

        let persisted = store.get(&GenerationId::new("idx", 1)).await.unwrap();
        assert_eq!(persisted.change_feed, Some(info));
    }

    #[tokio::test]
    async fn test_already_committed_returns_persisted_position() {
        let source = ScriptedSource::new(ts(10));
        let scheduler = Arc::new(RecordingScheduler::default());
        let (manager, store) = manager(&source, &scheduler).await;
        let committed = FeedResumeInfo {
            namespace: ns(),
            resume_token: ResumeToken::new("done"),
            operation_time: ts(9),
        };
        store
            .commit_metadata(&GenerationId::new("idx", 1), CommitMetadata::change_feed(committed.clone()))
            .await
            .unwrap();

        assert_eq!(manager.run(None).await.unwrap(), committed);
        assert!(source.scan_requests().is_empty());
    }

    #[tokio::test]
    async fn test_resume_reopens_feed_inclusively() {
        let source = ScriptedSource::new(ts(20)).with_pages(vec![vec![doc(json!({"_id": 7}))]]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let (manager, _store) = manager(&source, &scheduler).await;

        let resume = InitialSyncResumeInfo {
            high_water_mark: ts(15),
            last_scanned: ScanPosition::Key(Some(DocumentKey::Int(5))),
            sync_source_host: Some("host-b".to_string()),
        };
        manager.run(Some(resume)).await.unwrap();

        let feed = &source.feed_requests()[0];
        assert_eq!(feed.start, FeedStart::AtOperationTime(ts(15)));
        assert_eq!(feed.preferred_host.as_deref(), Some("host-b"));
        assert_eq!(
            source.scan_requests()[0].position,
            ScanPosition::Key(Some(DocumentKey::Int(5)))
        );
    }

    #[tokio::test]
    async fn test_scan_mode_mismatch_is_invalidated() {
        let source = ScriptedSource::new(ts(20));
        let scheduler = Arc::new(RecordingScheduler::default());
        let (manager, _store) = manager(&source, &scheduler).await;

        let resume = InitialSyncResumeInfo {
            high_water_mark: ts(15),
            last_scanned: ScanPosition::Natural(Some(ResumeToken::new("rid"))),
            sync_source_host: None,
        };
        let err = manager.run(Some(resume.clone())).await.unwrap_err();
        assert_eq!(err, SyncError::Invalidated(ResumeInfo::InitialSync(resume)));
        assert_eq!(*manager.phase().borrow(), InitialSyncPhase::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_reports_shutdown() {
        let source = ScriptedSource::new(ts(20)).with_pages(vec![vec![doc(json!({"_id": 1}))]]);
        let scheduler = Arc::new(RecordingScheduler::default());
        let (manager, store) = manager(&source, &scheduler).await;

        manager.shutdown();
        let err = manager.run(None).await.unwrap_err();
        assert!(err.is_shutdown());
        assert!(store.get(&GenerationId::new("idx", 1)).await.is_none());
    }

    struct FailingCommitter;

    impl IndexCommitter for FailingCommitter {
        fn commit<'a>(&'a self, _generation: &'a GenerationId, _metadata: CommitMetadata) -> BoxFuture<'a, ()> {
            Box::pin(async { Err(SyncError::requires_resync("disk says no")) })
        }

        fn load<'a>(&'a self, _generation: &'a GenerationId) -> BoxFuture<'a, Option<CommitMetadata>> {
            Box::pin(async { Ok(None) })
        }
    }

    #[tokio::test]
    async fn test_commit_failure_is_transient() {
        let source = ScriptedSource::new(ts(10));
        let scheduler = Arc::new(RecordingScheduler::default());
        let manager = InitialSyncManager::new(
            &ReplicationConfig::for_testing(),
            GenerationId::new("idx", 1),
            definition(),
            Arc::new(source.clone()),
            scheduler,
            Arc::new(FailingCommitter),
        );

        let err = manager.run(None).await.unwrap_err();
        assert!(err.is_transient(), "{err:?}");
    }
}
