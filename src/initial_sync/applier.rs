//! Change-feed tailing during initial sync.
//!
//! The applier owns the initial-sync feed cursor for the whole attempt. It
//! is opened lazily on the first [`ChangeFeedApplier::apply`] call and kept
//! open across scan rounds, so no event between rounds is skipped.
//!
//! # Phases of one `apply` call
//!
//! ```text
//! phase 1: catch up to the scan        phase 2: reduce lag (final round only)
//! ────────────────────────────         ─────────────────────────────────────
//! loop {                               while lag > max_lag && !timed_out {
//!     fetch, schedule                      fetch, schedule
//! } until high_water_mark >= stop_at   }
//! ```
//!
//! Lifecycle events are not absorbed here. The mutations before the event
//! are indexed, then the event surfaces as a typed error that ends the
//! attempt: there is no committed state yet that would be worth keeping.

use super::context::SyncContext;
use super::types::InitialSyncPhase;
use crate::batch::DocumentEventBatch;
use crate::error::{Result, SyncError};
use crate::feed::{classify_batch, FeedBatch, FeedEvent, LazyDecodeView, LifecycleEvent};
use crate::interfaces::{BatchFuture, FeedClient, FeedRequest};
use crate::metrics;
use crate::model::{CommitMetadata, FeedResumeInfo, Priority, ResumeInfo, ScanPosition, Timestamp};
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, Instrument};

pub(crate) struct ChangeFeedApplier<'a> {
    ctx: &'a SyncContext,
    /// Inclusive start of the feed, used when the cursor is first opened.
    start_at: Timestamp,
    high_water_mark: Timestamp,
    catchup_timeout: Duration,
    max_lag: Duration,
    feed: Option<Box<dyn FeedClient>>,
    resume: Option<FeedResumeInfo>,
    previous: Option<BatchFuture>,
}

impl<'a> ChangeFeedApplier<'a> {
    pub fn new(
        ctx: &'a SyncContext,
        start_at: Timestamp,
        high_water_mark: Timestamp,
        catchup_timeout: Duration,
        max_lag: Duration,
    ) -> Self {
        Self {
            ctx,
            start_at,
            high_water_mark,
            catchup_timeout,
            max_lag,
            feed: None,
            resume: None,
            previous: None,
        }
    }

    /// Feed time applied so far.
    pub fn high_water_mark(&self) -> Timestamp {
        self.high_water_mark
    }

    /// Position steady state resumes from, once at least one batch was read.
    pub fn resume_info(&self) -> Option<FeedResumeInfo> {
        self.resume.clone()
    }

    /// Tail the feed until it reaches `stop_at`, then, when
    /// `continue_after_catchup` is set, until lag is small or the catch-up
    /// timeout elapses.
    ///
    /// Returns the new high-water mark. Every batch scheduled here carries
    /// `last_scanned` in its commit metadata.
    pub async fn apply(
        &mut self,
        last_scanned: &ScanPosition,
        stop_at: Timestamp,
        continue_after_catchup: bool,
    ) -> Result<Timestamp> {
        let ctx = self.ctx;
        let span = info_span!(
            "change_feed_apply",
            index_id = %ctx.index_id(),
            generation = ctx.generation.generation
        );

        async move {
            match self.apply_phases(last_scanned, stop_at, continue_after_catchup).await {
                Ok(hwm) => Ok(hwm),
                Err(e) => {
                    self.previous = None;
                    Err(ctx.unwind(e).await)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn apply_phases(
        &mut self,
        last_scanned: &ScanPosition,
        stop_at: Timestamp,
        continue_after_catchup: bool,
    ) -> Result<Timestamp> {
        self.ensure_open().await?;

        debug!(stop_at = %stop_at, high_water_mark = %self.high_water_mark, "Catching up to scan");
        loop {
            self.step(last_scanned).await?;
            if self.high_water_mark >= stop_at {
                break;
            }
        }

        if continue_after_catchup {
            self.reduce_lag(last_scanned).await?;
        }

        if let Some(f) = self.previous.take() {
            f.await?;
        }
        Ok(self.high_water_mark)
    }

    async fn reduce_lag(&mut self, last_scanned: &ScanPosition) -> Result<()> {
        let ctx = self.ctx;
        ctx.set_phase(InitialSyncPhase::ReducingLag);
        let deadline = Instant::now() + self.catchup_timeout;

        loop {
            let committed = ctx.source.current_committed_time().await?;
            let lag = self.high_water_mark.lag_until(committed);
            metrics::record_replication_lag(ctx.index_id(), lag);
            if lag <= self.max_lag {
                debug!(lag = ?lag, "Lag within bounds");
                return Ok(());
            }
            if Instant::now() >= deadline {
                info!(lag = ?lag, "Catch-up timeout elapsed, finishing with remaining lag");
                return Ok(());
            }
            self.step(last_scanned).await?;
        }
    }

    async fn ensure_open(&mut self) -> Result<()> {
        if self.feed.is_some() {
            return Ok(());
        }
        let ctx = self.ctx;
        let current = ctx.source.resolve_collection_name(&ctx.definition).await?;
        if current != ctx.namespace.collection {
            return Err(SyncError::requires_resync(format!(
                "collection was renamed from {} to {current}",
                ctx.namespace.collection
            )));
        }

        info!(start_at = %self.start_at, "Opening initial sync change feed");
        let request = FeedRequest::at(ctx.namespace.clone(), self.start_at)
            .with_preferred_host(ctx.sync_source_host.clone());
        self.feed = Some(ctx.source.open_feed(request).await?);
        Ok(())
    }

    /// Fetch one batch, wait for the previous one, schedule this one.
    async fn step(&mut self, last_scanned: &ScanPosition) -> Result<()> {
        let ctx = self.ctx;
        ctx.check_shutdown()?;

        let feed = self
            .feed
            .as_mut()
            .ok_or_else(|| SyncError::transient("initial sync change feed is not open"))?;
        let fetch_start = Instant::now();
        let batch = feed.next_batch().await?;
        metrics::record_feed_batch(
            ctx.index_id(),
            "initial_sync",
            batch.len(),
            batch.byte_size(),
            fetch_start.elapsed(),
        );

        if let Some(f) = self.previous.take() {
            f.await?;
        }

        let prep_start = Instant::now();
        let (classification, events) = {
            let view = LazyDecodeView::new(&batch.events);
            let classification = classify_batch(&view, &ctx.namespace, None)?;
            let mutations = (0..classification.mutation_count)
                .map(|i| view.get(i).cloned())
                .collect::<Result<Vec<FeedEvent>>>()?;
            let events = DocumentEventBatch::from_feed_events(&mutations, &ctx.definition.mapping)?;
            (classification, events)
        };
        metrics::record_preprocessing(ctx.index_id(), prep_start.elapsed());
        metrics::record_updates(
            ctx.index_id(),
            "initial_sync_change_feed",
            events.witnessed,
            events.applicable,
        );
        ctx.record_skipped(events.skipped_keyless);

        if classification.pending_rename.is_some() || classification.lifecycle.is_some() {
            if !events.is_empty() {
                ctx.schedule(events.events, Priority::InitialSyncChangeFeed, None)
                    .await?;
            }
            let error = match classification.lifecycle {
                Some(lifecycle) => {
                    metrics::record_lifecycle_event(ctx.index_id(), lifecycle.label());
                    self.lifecycle_error(lifecycle, last_scanned)
                }
                None => {
                    metrics::record_lifecycle_event(ctx.index_id(), "renamed");
                    SyncError::requires_resync("collection was renamed")
                }
            };
            info!(error = %error, "Lifecycle event during initial sync");
            return Err(error);
        }

        self.advance(&batch);
        let metadata =
            CommitMetadata::initial_sync(ctx.resume_info(self.high_water_mark, last_scanned.clone()));
        self.previous = Some(ctx.schedule(
            events.events,
            Priority::InitialSyncChangeFeed,
            Some(metadata),
        ));
        Ok(())
    }

    fn advance(&mut self, batch: &FeedBatch) {
        if batch.operation_time > self.high_water_mark {
            self.high_water_mark = batch.operation_time;
        }
        self.resume = Some(FeedResumeInfo {
            namespace: self.ctx.namespace.clone(),
            resume_token: batch.post_batch_token.clone(),
            operation_time: batch.operation_time,
        });
    }

    fn lifecycle_error(&self, lifecycle: LifecycleEvent, last_scanned: &ScanPosition) -> SyncError {
        match lifecycle {
            LifecycleEvent::Dropped { reason } => SyncError::Dropped(reason),
            LifecycleEvent::Renamed(_)
            | LifecycleEvent::UnconfirmedRename { .. }
            | LifecycleEvent::RenameWithoutDestination => {
                SyncError::requires_resync("collection was renamed")
            }
            LifecycleEvent::Invalidated(info) => {
                let at = match info {
                    ResumeInfo::ChangeFeed(feed) => feed.operation_time,
                    ResumeInfo::InitialSync(initial) => initial.high_water_mark,
                };
                SyncError::Invalidated(ResumeInfo::InitialSync(
                    self.ctx.resume_info(at, last_scanned.clone()),
                ))
            }
            other => other
                .into_error()
                .unwrap_or_else(|| SyncError::requires_resync("unexpected lifecycle event")),
        }
    }

    /// Close the feed cursor, if one was opened.
    pub async fn close(&mut self) -> Result<()> {
        match self.feed.take() {
            Some(mut feed) => feed.close().await,
            None => Ok(()),
        }
    }
}
