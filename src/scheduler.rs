//! In-process work schedulers for decoding and indexing.
//!
//! [`WorkQueue`] is the shared engine: a fixed set of Tokio workers pulling
//! from a priority queue with a FIFO lane per generation.
//!
//! # Ordering
//!
//! ```text
//!             gen A lane: [a1] [a2] [a3]      ← only a1 is eligible
//!             gen B lane: [b1]                ← eligible
//!             gen C lane: (a batch in flight) ← nothing eligible
//!
//! worker picks min (priority, sequence) among eligible heads
//! ```
//!
//! At most one batch per generation runs at a time, so events of one
//! generation are applied in the order they were scheduled, while
//! different generations proceed in parallel.
//!
//! # Cancellation
//!
//! `cancel(generation, attempt, reason)` fails every queued batch of that
//! attempt (and of older attempts) with `reason`, remembers the attempt so
//! later submissions fail immediately, and then waits for the generation's
//! in-flight batch to finish. Batches of newer attempts are left alone.

use crate::error::{Result, SyncError};
use crate::feed::{FeedEvent, RawFeedEvent};
use crate::interfaces::{
    BatchFuture, BoxFuture, DecodeScheduler, Indexer, IndexingScheduler, OnDecoded,
};
use crate::batch::DocumentEvent;
use crate::metrics;
use crate::model::{AttemptId, CommitMetadata, GenerationId, Priority};
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Deferred unit of work. Invoked on a worker, never on the caller.
type Work = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

struct QueuedBatch {
    seq: u64,
    priority: Priority,
    attempt: AttemptId,
    work: Work,
    done: oneshot::Sender<Result<()>>,
}

#[derive(Default)]
struct GenerationLane {
    pending: VecDeque<QueuedBatch>,
    in_flight: bool,
    /// Newest cancelled attempt and the reason it was cancelled.
    cancelled: Option<(AttemptId, SyncError)>,
    /// Forgotten while busy; removed once it goes idle.
    retired: bool,
}

impl GenerationLane {
    fn cancelled_reason(&self, attempt: AttemptId) -> Option<SyncError> {
        match &self.cancelled {
            Some((newest, reason)) if attempt <= *newest => Some(reason.clone()),
            _ => None,
        }
    }
}

#[derive(Default)]
struct QueueState {
    lanes: HashMap<GenerationId, GenerationLane>,
    next_seq: u64,
    queued: usize,
    shutdown: bool,
}

impl QueueState {
    /// Pop the best eligible head and mark its generation in flight.
    fn take_next(&mut self) -> Option<(GenerationId, QueuedBatch)> {
        let generation = self
            .lanes
            .iter()
            .filter(|(_, lane)| !lane.in_flight)
            .filter_map(|(gen, lane)| lane.pending.front().map(|b| ((b.priority, b.seq), gen)))
            .min_by_key(|(order, _)| *order)
            .map(|(_, gen)| gen.clone())?;

        let lane = self.lanes.get_mut(&generation)?;
        let batch = lane.pending.pop_front()?;
        lane.in_flight = true;
        self.queued -= 1;
        Some((generation, batch))
    }
}

struct Inner {
    name: &'static str,
    state: Mutex<QueueState>,
    work_available: Notify,
    batch_finished: Notify,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ready(result: Result<()>) -> BatchFuture {
    let fut: BoxFuture<'static, ()> = Box::pin(async move { result });
    fut.shared()
}

/// Priority queue with one FIFO lane per generation, drained by a fixed
/// number of Tokio workers.
pub struct WorkQueue {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Spawn `num_workers` workers. Must be called within a Tokio runtime.
    pub fn new(name: &'static str, num_workers: usize) -> Self {
        let inner = Arc::new(Inner {
            name,
            state: Mutex::new(QueueState::default()),
            work_available: Notify::new(),
            batch_finished: Notify::new(),
        });
        let workers = (0..num_workers.max(1))
            .map(|_| tokio::spawn(run_worker(Arc::clone(&inner))))
            .collect();
        debug!(scheduler = name, workers = num_workers.max(1), "Work queue started");
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Queue `work` behind the generation's earlier batches.
    ///
    /// The returned future resolves with the work's result, or with the
    /// cancellation reason if the batch never ran.
    pub fn schedule<F, Fut>(
        &self,
        generation: &GenerationId,
        attempt: AttemptId,
        priority: Priority,
        work: F,
    ) -> BatchFuture
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let work: Work = Box::new(move || work().boxed());
        let (done, rx) = oneshot::channel();
        {
            let mut state = self.inner.lock();
            if state.shutdown {
                return ready(Err(SyncError::ShutDown));
            }
            let seq = state.next_seq;
            state.next_seq += 1;

            let lane = state.lanes.entry(generation.clone()).or_default();
            lane.retired = false;
            if let Some(reason) = lane.cancelled_reason(attempt) {
                debug!(generation = %generation, %attempt, "Rejecting batch of cancelled attempt");
                return ready(Err(reason));
            }
            lane.pending.push_back(QueuedBatch {
                seq,
                priority,
                attempt,
                work,
                done,
            });
            state.queued += 1;
            metrics::set_queued_batches(self.inner.name, state.queued);
        }
        self.inner.work_available.notify_one();

        let fut: BoxFuture<'static, ()> = Box::pin(async move {
            rx.await
                .unwrap_or_else(|_| Err(SyncError::transient("scheduler dropped the batch")))
        });
        fut.shared()
    }

    /// Fail queued batches of `attempt` (and older attempts), then wait for
    /// the generation's in-flight batch to finish.
    pub async fn cancel(&self, generation: &GenerationId, attempt: AttemptId, reason: SyncError) {
        let failed: Vec<QueuedBatch> = {
            let mut state = self.inner.lock();
            let lane = state.lanes.entry(generation.clone()).or_default();
            let newest = match &lane.cancelled {
                Some((prev, _)) if *prev > attempt => *prev,
                _ => attempt,
            };
            lane.cancelled = Some((newest, reason.clone()));

            let (failed, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut lane.pending)
                .into_iter()
                .partition(|b| b.attempt <= attempt);
            lane.pending = kept;
            state.queued -= failed.len();
            metrics::set_queued_batches(self.inner.name, state.queued);
            failed.into_iter().collect()
        };

        if !failed.is_empty() {
            debug!(
                scheduler = self.inner.name,
                generation = %generation,
                %attempt,
                count = failed.len(),
                "Cancelled queued batches"
            );
        }
        for batch in failed {
            let _ = batch.done.send(Err(reason.clone()));
        }

        loop {
            let finished = self.inner.batch_finished.notified();
            let in_flight = self
                .inner
                .lock()
                .lanes
                .get(generation)
                .is_some_and(|lane| lane.in_flight);
            if !in_flight {
                return;
            }
            finished.await;
        }
    }

    /// Drop per-generation bookkeeping of a retired generation.
    ///
    /// A lane that still has a batch in flight is removed when that batch
    /// finishes. Queued batches are failed with `ShutDown`.
    pub fn forget(&self, generation: &GenerationId) {
        let failed: Vec<QueuedBatch> = {
            let mut state = self.inner.lock();
            let Some(lane) = state.lanes.get_mut(generation) else {
                return;
            };
            let failed: Vec<QueuedBatch> = lane.pending.drain(..).collect();
            if lane.in_flight {
                lane.retired = true;
            } else {
                state.lanes.remove(generation);
            }
            state.queued -= failed.len();
            metrics::set_queued_batches(self.inner.name, state.queued);
            failed
        };
        if !failed.is_empty() {
            warn!(
                scheduler = self.inner.name,
                generation = %generation,
                count = failed.len(),
                "Forgot generation with queued batches"
            );
        }
        for batch in failed {
            let _ = batch.done.send(Err(SyncError::ShutDown));
        }
    }

    /// Generations the queue currently keeps a lane for.
    pub fn tracked_generations(&self) -> usize {
        self.inner.lock().lanes.len()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queued
    }

    /// Stop accepting work, fail queued batches with `ShutDown`, and wait
    /// for the workers to finish their current batch.
    pub async fn shutdown(&self) {
        let failed: Vec<QueuedBatch> = {
            let mut state = self.inner.lock();
            if state.shutdown {
                Vec::new()
            } else {
                state.shutdown = true;
                state.queued = 0;
                metrics::set_queued_batches(self.inner.name, 0);
                state
                    .lanes
                    .values_mut()
                    .flat_map(|lane| std::mem::take(&mut lane.pending))
                    .collect()
            }
        };
        for batch in failed {
            let _ = batch.done.send(Err(SyncError::ShutDown));
        }
        self.inner.work_available.notify_waiters();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(scheduler = self.inner.name, error = %e, "Worker exited abnormally");
            }
        }
        info!(scheduler = self.inner.name, "Work queue stopped");
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.inner.lock().shutdown = true;
        self.inner.work_available.notify_waiters();
    }
}

async fn run_worker(inner: Arc<Inner>) {
    loop {
        let notified = inner.work_available.notified();
        let next = {
            let mut state = inner.lock();
            if state.shutdown {
                return;
            }
            let next = state.take_next();
            if next.is_some() {
                metrics::set_queued_batches(inner.name, state.queued);
            }
            next
        };

        let Some((generation, batch)) = next else {
            notified.await;
            continue;
        };

        // A panicking batch must not take the worker down with it.
        let result = match tokio::spawn((batch.work)()).await {
            Ok(result) => result,
            Err(e) => Err(SyncError::from(e)),
        };

        {
            let mut state = inner.lock();
            let reclaim = match state.lanes.get_mut(&generation) {
                Some(lane) => {
                    lane.in_flight = false;
                    lane.retired && lane.pending.is_empty()
                }
                None => false,
            };
            if reclaim {
                state.lanes.remove(&generation);
            }
        }
        let _ = batch.done.send(result);
        inner.batch_finished.notify_waiters();
        // The generation's next batch may now be eligible.
        inner.work_available.notify_one();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Indexing
// ═══════════════════════════════════════════════════════════════════════════════

/// [`IndexingScheduler`] that runs batches against an [`Indexer`].
pub struct IndexingWorkScheduler {
    queue: WorkQueue,
    indexer: Arc<dyn Indexer>,
}

impl IndexingWorkScheduler {
    pub fn new(indexer: Arc<dyn Indexer>, num_workers: usize) -> Self {
        Self {
            queue: WorkQueue::new("indexing", num_workers),
            indexer,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

impl IndexingScheduler for IndexingWorkScheduler {
    fn schedule(
        &self,
        generation: &GenerationId,
        attempt: AttemptId,
        events: Vec<DocumentEvent>,
        priority: Priority,
        metadata: Option<CommitMetadata>,
    ) -> BatchFuture {
        let indexer = Arc::clone(&self.indexer);
        let gen = generation.clone();
        self.queue.schedule(generation, attempt, priority, move || async move {
            indexer.index(gen, events, priority, metadata).await
        })
    }

    fn cancel<'a>(
        &'a self,
        generation: &'a GenerationId,
        attempt: AttemptId,
        reason: SyncError,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.queue.cancel(generation, attempt, reason).await;
            Ok(())
        })
    }

    fn forget(&self, generation: &GenerationId) {
        self.queue.forget(generation);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decoding
// ═══════════════════════════════════════════════════════════════════════════════

/// [`DecodeScheduler`] that decodes raw records on the blocking pool.
pub struct DecodingWorkScheduler {
    queue: WorkQueue,
}

impl DecodingWorkScheduler {
    pub fn new(num_workers: usize) -> Self {
        Self {
            queue: WorkQueue::new("decoding", num_workers),
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

fn decode_all(records: &[RawFeedEvent]) -> Result<Vec<FeedEvent>> {
    records.iter().map(RawFeedEvent::decode).collect()
}

impl DecodeScheduler for DecodingWorkScheduler {
    fn schedule(
        &self,
        generation: &GenerationId,
        attempt: AttemptId,
        records: Vec<RawFeedEvent>,
        priority: Priority,
        on_decoded: OnDecoded,
    ) -> BatchFuture {
        self.queue.schedule(generation, attempt, priority, move || async move {
            let events = tokio::task::spawn_blocking(move || decode_all(&records)).await??;
            on_decoded(events)
        })
    }

    fn cancel<'a>(
        &'a self,
        generation: &'a GenerationId,
        attempt: AttemptId,
        reason: SyncError,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.queue.cancel(generation, attempt, reason).await;
            Ok(())
        })
    }

    fn forget(&self, generation: &GenerationId) {
        self.queue.forget(generation);
    }
}
