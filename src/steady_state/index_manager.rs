//! Per-generation index manager actor.
//!
//! Every state transition of one generation (pending rename, failure latch,
//! cancellation) runs on a single task that owns the state and serves
//! commands off one channel, so no lock guards the compound transitions.
//!
//! ```text
//!  dispatcher ──IndexBatch──────▶ ┌─────────────┐ ──schedule──▶ indexing scheduler
//!  dispatcher ──FailLifecycle───▶ │ IndexManager│ ──schedule──▶ decode scheduler
//!  on_decoded ──ScheduleIndexing▶ └─────────────┘                    │
//!       ▲                                                            │
//!       └────────────────────────── decoded records ◀────────────────┘
//! ```
//!
//! # Failure ordering
//!
//! `FailLifecycle` latches the first cause, cancels queued decode work,
//! cancels queued index work and only then completes the lifecycle watch.
//! A `ScheduleIndexing` that arrives after the latch is refused, so nothing
//! is scheduled for a generation that observers already consider finished.

use crate::batch::{DocumentEvent, DocumentEventBatch};
use crate::error::{Result, SyncError};
use crate::feed::{
    classify_batch, classify_batch_tail, select_resume_info, FeedBatch, FeedEvent,
    LazyDecodeView, LifecycleEvent,
};
use crate::interfaces::{BatchFuture, BoxFuture, DecodeScheduler, IndexingScheduler};
use crate::metrics;
use crate::model::{
    AttemptId, CommitMetadata, FeedResumeInfo, GenerationId, IndexMapping, Namespace, Priority,
};
use crate::resilience::RateLimitedWarn;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

const SOURCE: &str = "steady_state";

/// A feed batch handed to the schedulers.
pub(crate) struct ScheduledFeedBatch {
    /// Resolves once the batch's mutation prefix is indexed.
    pub future: BatchFuture,
    /// Position to publish once `future` succeeds.
    pub resume: Option<FeedResumeInfo>,
    /// Condition that ends the generation after `future` resolves.
    pub lifecycle: Option<LifecycleEvent>,
}

enum Command {
    IndexBatch {
        batch: FeedBatch,
        reply: oneshot::Sender<Result<ScheduledFeedBatch>>,
    },
    ScheduleIndexing {
        events: Vec<DocumentEvent>,
        metadata: Option<CommitMetadata>,
        reply: oneshot::Sender<BatchFuture>,
    },
    FailLifecycle {
        error: SyncError,
        reply: oneshot::Sender<()>,
    },
    IsShutdown {
        reply: oneshot::Sender<bool>,
    },
}

/// Everything the actor needs to schedule work for one generation.
pub(crate) struct IndexManagerParams {
    pub generation: GenerationId,
    pub attempt: AttemptId,
    pub namespace: Namespace,
    pub mapping: IndexMapping,
    pub indexing: Arc<dyn IndexingScheduler>,
    pub decoding: Option<Arc<dyn DecodeScheduler>>,
    pub skipped_warn: Arc<RateLimitedWarn>,
}

/// Cloneable front end of the actor.
#[derive(Clone)]
pub(crate) struct IndexManagerHandle {
    commands: mpsc::UnboundedSender<Command>,
    lifecycle: watch::Receiver<Option<SyncError>>,
}

impl IndexManagerHandle {
    /// Classify `batch` and schedule its mutation prefix.
    pub async fn index_batch(&self, batch: FeedBatch) -> Result<ScheduledFeedBatch> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::IndexBatch { batch, reply }).is_err() {
            return Err(self.stopped_error());
        }
        rx.await.unwrap_or_else(|_| Err(self.stopped_error()))
    }

    /// End the generation with `error`. Only the first cause is kept.
    pub async fn fail_lifecycle(&self, error: SyncError) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::FailLifecycle { error, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn shutdown(&self) {
        self.fail_lifecycle(SyncError::ShutDown).await;
    }

    /// Whether the generation has been failed or shut down.
    pub async fn is_shut_down(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::IsShutdown { reply }).is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    pub fn lifecycle(&self) -> watch::Receiver<Option<SyncError>> {
        self.lifecycle.clone()
    }

    fn stopped_error(&self) -> SyncError {
        self.lifecycle.borrow().clone().unwrap_or(SyncError::ShutDown)
    }
}

/// The actor state. Owned by its task.
pub(crate) struct IndexManager {
    params: IndexManagerParams,
    commands: mpsc::WeakUnboundedSender<Command>,
    pending_rename: Option<Namespace>,
    failure: Option<SyncError>,
    lifecycle: watch::Sender<Option<SyncError>>,
}

impl IndexManager {
    /// Start the actor. It runs until every handle is dropped.
    pub fn spawn(params: IndexManagerParams) -> (IndexManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (lifecycle, lifecycle_rx) = watch::channel(None);
        let span = info_span!(
            "index_manager",
            generation = %params.generation,
            attempt = %params.attempt
        );
        let actor = Self {
            params,
            commands: tx.downgrade(),
            pending_rename: None,
            failure: None,
            lifecycle,
        };
        let task = tokio::spawn(actor.run(rx).instrument(span));
        let handle = IndexManagerHandle {
            commands: tx,
            lifecycle: lifecycle_rx,
        };
        (handle, task)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::IndexBatch { batch, reply } => {
                    let _ = reply.send(self.index_batch(batch));
                }
                Command::ScheduleIndexing {
                    events,
                    metadata,
                    reply,
                } => {
                    let _ = reply.send(self.schedule_indexing(events, metadata));
                }
                Command::FailLifecycle { error, reply } => {
                    self.fail(error).await;
                    let _ = reply.send(());
                }
                Command::IsShutdown { reply } => {
                    let _ = reply.send(self.failure.is_some());
                }
            }
        }
        debug!("Index manager stopped");
    }

    fn index_batch(&mut self, batch: FeedBatch) -> Result<ScheduledFeedBatch> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }

        let started = Instant::now();
        let namespace = &self.params.namespace;
        let view = LazyDecodeView::new(&batch.events);
        let pending = self.pending_rename.take();
        let classification = if self.params.decoding.is_some() {
            classify_batch_tail(&view, namespace, pending)?
        } else {
            classify_batch(&view, namespace, pending)?
        };
        let resume = select_resume_info(&batch, &view, namespace)?;
        let metadata = resume.clone().map(CommitMetadata::change_feed);
        self.pending_rename = classification.pending_rename.clone();

        let future = match &self.params.decoding {
            Some(decoding) => {
                let records = batch.events[..classification.mutation_count].to_vec();
                let on_decoded = self.on_decoded(metadata);
                let (tx, rx) = oneshot::channel();
                let decoded = decoding.schedule(
                    &self.params.generation,
                    self.params.attempt,
                    records,
                    Priority::SteadyStateChangeFeed,
                    Box::new(move |events| on_decoded(events, tx)),
                );
                let generation_failed = self.failure_hint();
                let future: BoxFuture<'static, ()> = Box::pin(async move {
                    decoded.await?;
                    let indexed = rx.await.map_err(|_| generation_failed())?;
                    indexed.await
                });
                future.shared()
            }
            None => {
                let events = (0..classification.mutation_count)
                    .map(|i| view.get(i))
                    .collect::<Result<Vec<&FeedEvent>>>()?;
                let converted = DocumentEventBatch::from_feed_events(events, &self.params.mapping)?;
                record_batch(&self.params, &converted);
                self.schedule_indexing(converted.events, metadata)
            }
        };
        metrics::record_preprocessing(&self.params.generation.index_id, started.elapsed());

        if let Some(lifecycle) = &classification.lifecycle {
            info!(lifecycle = lifecycle.label(), "Lifecycle event in change feed batch");
        }
        Ok(ScheduledFeedBatch {
            future,
            resume,
            lifecycle: classification.lifecycle,
        })
    }

    /// Continuation run on a decode worker: convert the records, then hand
    /// the events back to the actor for scheduling.
    fn on_decoded(
        &self,
        metadata: Option<CommitMetadata>,
    ) -> impl FnOnce(Vec<FeedEvent>, oneshot::Sender<BatchFuture>) -> Result<()> + Send + 'static
    {
        let commands = self.commands.clone();
        let mapping = self.params.mapping.clone();
        let index_id = self.params.generation.index_id.clone();
        let skipped_warn = Arc::clone(&self.params.skipped_warn);
        move |events, reply| {
            let converted = DocumentEventBatch::from_feed_events(&events, &mapping)?;
            metrics::record_updates(&index_id, SOURCE, converted.witnessed, converted.applicable);
            warn_skipped(&index_id, &skipped_warn, converted.skipped_keyless);
            let commands = commands.upgrade().ok_or(SyncError::ShutDown)?;
            commands
                .send(Command::ScheduleIndexing {
                    events: converted.events,
                    metadata,
                    reply,
                })
                .map_err(|_| SyncError::ShutDown)
        }
    }

    /// Error for a decode continuation whose scheduling reply never came.
    fn failure_hint(&self) -> impl FnOnce() -> SyncError + Send + 'static {
        let lifecycle = self.lifecycle.subscribe();
        move || lifecycle.borrow().clone().unwrap_or(SyncError::ShutDown)
    }

    fn schedule_indexing(
        &self,
        events: Vec<DocumentEvent>,
        metadata: Option<CommitMetadata>,
    ) -> BatchFuture {
        if let Some(failure) = &self.failure {
            debug!("Refusing to index decoded batch of a failed generation");
            let failure = failure.clone();
            let future: BoxFuture<'static, ()> =
                Box::pin(async move { Err(failure) });
            return future.shared();
        }
        self.params.indexing.schedule(
            &self.params.generation,
            self.params.attempt,
            events,
            Priority::SteadyStateChangeFeed,
            metadata,
        )
    }

    async fn fail(&mut self, error: SyncError) {
        if let Some(first) = &self.failure {
            debug!(first = %first, ignored = %error, "Generation already failed");
            return;
        }
        self.failure = Some(error.clone());
        if error.is_shutdown() {
            info!("Shutting down generation");
        } else {
            warn!(error = %error, kind = error.kind().as_str(), "Failing generation");
        }

        let generation = &self.params.generation;
        let attempt = self.params.attempt;
        if let Some(decoding) = &self.params.decoding {
            if let Err(e) = decoding.cancel(generation, attempt, error.clone()).await {
                debug!(error = %e, "Decode cancellation failed");
            }
        }
        if let Err(e) = self
            .params
            .indexing
            .cancel(generation, attempt, error.clone())
            .await
        {
            debug!(error = %e, "Index cancellation failed");
        }

        self.lifecycle.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(error);
            true
        });
    }
}

fn record_batch(params: &IndexManagerParams, converted: &DocumentEventBatch) {
    let index_id = &params.generation.index_id;
    metrics::record_updates(index_id, SOURCE, converted.witnessed, converted.applicable);
    warn_skipped(index_id, &params.skipped_warn, converted.skipped_keyless);
}

fn warn_skipped(index_id: &str, limiter: &RateLimitedWarn, count: usize) {
    if count == 0 {
        return;
    }
    metrics::record_skipped_keyless(index_id, count);
    if limiter.should_warn() {
        warn!(index_id, count, "Skipping change events without a usable document key");
    }
}
