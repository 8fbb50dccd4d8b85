// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Steady state: tail the change feed of every committed generation.
//!
//! # Architecture
//!
//! ```text
//!                        ChangeFeedManager
//!                               │ add(definition, generation, resume)
//!          ┌────────────────────┼────────────────────┐
//!          ▼                    ▼                    ▼
//!     Dispatcher A         Dispatcher B         Dispatcher C     ◀── pool of N slots
//!          │ fetch              │                    │              (+ embedding permits)
//!          ▼                    ▼                    ▼
//!   TimedFeedClient      ... one per generation ...
//!    └ ModeAwareFeedClient
//!          │ batch
//!          ▼
//!     IndexManager actor ──▶ DecodeScheduler? ──▶ IndexingScheduler
//!          │
//!          └──▶ lifecycle watch (completed exactly once)
//! ```
//!
//! A generation is tailed until its change feed reports a lifecycle event
//! (drop, rename, invalidate, ...), an unexpected failure occurs, or it is
//! stopped. In every case the generation's [`LifecycleHandle`] resolves
//! exactly once with the cause, and the fleet-level owner decides whether to
//! resume, resync or drop the index.
//!
//! # Resume Info
//!
//! After each indexed batch the position selected for it is published on a
//! per-generation watch; [`ChangeFeedManager::resume_info`] reads it.
//! Positions only move forward.

mod client;
mod dispatcher;
mod index_manager;
mod mode;

pub use client::{ModeAwareFeedClient, RestartableFeed, TimedFeedClient};
pub use mode::{HeuristicModeSelector, MIN_DOCUMENTS_FOR_SELECTION, PROJECTION_SIZE_RATIO};

use crate::config::ReplicationConfig;
use crate::error::{Result, SyncError};
use crate::feed::LifecycleEvent;
use crate::interfaces::{
    DecodeScheduler, FeedClient, FeedStart, IndexCommitter, IndexingScheduler, ModeSelector,
    SourceClient,
};
use crate::metrics;
use crate::model::{AttemptId, FeedResumeInfo, GenerationId, IndexDefinition, IndexKind, Namespace};
use crate::resilience::{EmbeddingPermits, RateLimitedWarn};
use crate::scheduler::DecodingWorkScheduler;
use dispatcher::{DispatchPool, Dispatcher};
use index_manager::{IndexManager, IndexManagerHandle, IndexManagerParams};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Observer side of a generation's lifecycle.
#[derive(Clone)]
pub struct LifecycleHandle {
    generation: GenerationId,
    lifecycle: watch::Receiver<Option<SyncError>>,
}

impl LifecycleHandle {
    pub fn generation(&self) -> &GenerationId {
        &self.generation
    }

    /// The cause the generation ended with, if it has ended.
    pub fn cause(&self) -> Option<SyncError> {
        self.lifecycle.borrow().clone()
    }

    /// Wait for the generation to end and return the cause.
    pub async fn wait(&mut self) -> SyncError {
        if let Ok(cause) = self.lifecycle.wait_for(Option::is_some).await {
            if let Some(cause) = cause.clone() {
                return cause;
            }
        }
        self.lifecycle.borrow().clone().unwrap_or(SyncError::ShutDown)
    }
}

struct GenerationEntry {
    kind: IndexKind,
    manager: IndexManagerHandle,
    resume: watch::Receiver<Option<FeedResumeInfo>>,
    dispatcher: JoinHandle<()>,
}

impl GenerationEntry {
    fn is_finished(&self) -> bool {
        self.manager.lifecycle().borrow().is_some()
    }
}

/// Tails the change feeds of all steady-state generations.
pub struct ChangeFeedManager {
    config: ReplicationConfig,
    source: Arc<dyn SourceClient>,
    indexing: Arc<dyn IndexingScheduler>,
    decoding: Option<Arc<dyn DecodeScheduler>>,
    selector: Arc<dyn ModeSelector>,
    skipped_warn: Arc<RateLimitedWarn>,
    pool: DispatchPool,
    committer: Option<Arc<dyn IndexCommitter>>,
    generations: RwLock<HashMap<GenerationId, GenerationEntry>>,
    starting: StdMutex<HashSet<GenerationId>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ChangeFeedManager {
    /// Build a manager. With `use_decoding_executor` set, an in-process
    /// decoding scheduler is started, so this must run within a Tokio
    /// runtime.
    pub fn new(
        config: &ReplicationConfig,
        source: Arc<dyn SourceClient>,
        indexing: Arc<dyn IndexingScheduler>,
        selector: Arc<dyn ModeSelector>,
    ) -> Self {
        let steady = &config.steady_state;
        let decoding: Option<Arc<dyn DecodeScheduler>> = if steady.use_decoding_executor {
            Some(Arc::new(DecodingWorkScheduler::new(
                config.scheduler.num_decoding_workers,
            )))
        } else {
            None
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = DispatchPool {
            slots: Arc::new(Semaphore::new(steady.num_concurrent_change_feeds.max(1))),
            embedding: steady.max_in_flight_embedding_fetches.map(EmbeddingPermits::new),
            reschedule_delay: steady.embedding_reschedule_delay(),
            optime_log_period: steady.optime_log_period(),
            fetches_in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown: shutdown_rx,
        };

        Self {
            config: config.clone(),
            source,
            indexing,
            decoding,
            selector,
            skipped_warn: Arc::new(RateLimitedWarn::new(config.skipped_record_warn_interval())),
            pool,
            committer: None,
            generations: RwLock::new(HashMap::new()),
            starting: StdMutex::new(HashSet::new()),
            shutdown_tx,
        }
    }

    /// Decode on `decoding` instead of inline.
    pub fn with_decode_scheduler(mut self, decoding: Arc<dyn DecodeScheduler>) -> Self {
        self.decoding = Some(decoding);
        self
    }

    /// Discard persisted resume metadata through `committer` on
    /// [`retire`](Self::retire).
    pub fn with_committer(mut self, committer: Arc<dyn IndexCommitter>) -> Self {
        self.committer = Some(committer);
        self
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Start tailing `generation` just after `resume`.
    ///
    /// A generation that is still tailing (or still being added) is rejected
    /// as `Transient`; one whose lifecycle already completed is replaced.
    /// Resolving the collection and opening its feed happen outside the
    /// generation table lock, bounded by `feed_open_timeout`, and give way
    /// to [`shutdown`](Self::shutdown).
    pub async fn add(
        &self,
        definition: IndexDefinition,
        generation: GenerationId,
        resume: FeedResumeInfo,
    ) -> Result<LifecycleHandle> {
        if self.is_shutting_down() {
            return Err(SyncError::ShutDown);
        }
        let _reservation = {
            let generations = self.generations.read().await;
            if generations
                .get(&generation)
                .is_some_and(|existing| !existing.is_finished())
            {
                return Err(already_tailing(&generation));
            }
            Reservation::take(&self.starting, &generation)
                .ok_or_else(|| already_tailing(&generation))?
        };

        let span = info_span!("steady_state", generation = %generation);
        let timeout = self.config.steady_state.feed_open_timeout();
        let opening = tokio::time::timeout(timeout, self.open(&definition, &generation, &resume));
        let opened = tokio::select! {
            biased;
            _ = shutdown_requested(self.shutdown_tx.subscribe()) => return Err(SyncError::ShutDown),
            opened = opening.instrument(span.clone()) => opened,
        };
        let (namespace, mut client) = match opened {
            Ok(opened) => opened?,
            Err(_) => {
                warn!(generation = %generation, timeout = ?timeout, "Timed out opening change feed");
                return Err(SyncError::transient(format!(
                    "timed out after {timeout:?} opening the change feed of {generation}"
                )));
            }
        };

        let mut generations = self.generations.write().await;
        if self.is_shutting_down() {
            drop(generations);
            if let Err(e) = client.close().await {
                debug!(generation = %generation, error = %e, "Failed to close change feed");
            }
            return Err(SyncError::ShutDown);
        }
        if let Some(stale) = generations.remove(&generation) {
            stale.dispatcher.abort();
            self.release(&generation);
        }

        let entry = span.in_scope(|| self.launch(&definition, &generation, namespace, client, resume));
        let handle = LifecycleHandle {
            generation: generation.clone(),
            lifecycle: entry.manager.lifecycle(),
        };
        generations.insert(generation, entry);
        metrics::set_active_generations(generations.len());
        Ok(handle)
    }

    /// Resolve the collection and open its feed.
    async fn open(
        &self,
        definition: &IndexDefinition,
        generation: &GenerationId,
        resume: &FeedResumeInfo,
    ) -> Result<(Namespace, Box<dyn FeedClient>)> {
        let observed = self.source.resolve_collection_name(definition).await?;
        let mut namespace = definition.namespace();
        if observed != definition.last_observed_collection {
            let change = LifecycleEvent::NamespaceChanged {
                from: namespace.clone(),
                to: namespace.with_collection(observed.clone()),
            };
            metrics::record_lifecycle_event(&generation.index_id, change.label());
            info!(
                from = %namespace,
                to = observed.as_str(),
                "Collection was renamed since the definition was written, following it"
            );
            namespace = namespace.with_collection(observed);
        }

        let steady = &self.config.steady_state;
        let mode_aware = ModeAwareFeedClient::open(
            Arc::clone(&self.source),
            Arc::clone(&self.selector),
            generation.clone(),
            namespace.clone(),
            FeedStart::AfterToken(resume.resume_token.clone()),
        )
        .await?
        .with_refresh_period(steady.mode_refresh_period());
        let client: Box<dyn FeedClient> = Box::new(TimedFeedClient::new(
            mode_aware,
            steady.cursor_max_age(),
            steady.cursor_max_age_jitter,
        ));
        Ok((namespace, client))
    }

    /// Spawn the index manager and dispatcher for an opened feed.
    fn launch(
        &self,
        definition: &IndexDefinition,
        generation: &GenerationId,
        namespace: Namespace,
        client: Box<dyn FeedClient>,
        resume: FeedResumeInfo,
    ) -> GenerationEntry {
        let attempt = AttemptId::next();
        let (manager, _actor) = IndexManager::spawn(IndexManagerParams {
            generation: generation.clone(),
            attempt,
            namespace,
            mapping: definition.mapping.clone(),
            indexing: Arc::clone(&self.indexing),
            decoding: self.decoding.clone(),
            skipped_warn: Arc::clone(&self.skipped_warn),
        });

        let (resume_tx, resume_rx) = watch::channel(Some(resume));
        let dispatcher = Dispatcher::new(
            generation.clone(),
            definition.kind,
            client,
            manager.clone(),
            resume_tx,
            self.pool.clone(),
        );
        let span = info_span!("change_feed_dispatch", generation = %generation, %attempt);
        let dispatcher = tokio::spawn(dispatcher.run().instrument(span));
        debug!(%attempt, "Change feed tailing started");

        GenerationEntry {
            kind: definition.kind,
            manager,
            resume: resume_rx,
            dispatcher,
        }
    }

    /// Latest position published for `generation`.
    pub async fn resume_info(&self, generation: &GenerationId) -> Option<FeedResumeInfo> {
        let generations = self.generations.read().await;
        generations
            .get(generation)
            .and_then(|entry| entry.resume.borrow().clone())
    }

    pub async fn generations(&self) -> Vec<GenerationId> {
        self.generations.read().await.keys().cloned().collect()
    }

    /// Shut one generation down and wait for it to drain.
    pub async fn stop(&self, generation: &GenerationId) -> Result<()> {
        let entry = {
            let mut generations = self.generations.write().await;
            let entry = generations.remove(generation);
            metrics::set_active_generations(generations.len());
            entry
        };
        match entry {
            Some(entry) => self.drain(generation, entry).await,
            None => Ok(()),
        }
    }

    /// Stop a generation that will never be tailed again and discard its
    /// persisted resume metadata.
    pub async fn retire(&self, generation: &GenerationId) -> Result<()> {
        self.stop(generation).await?;
        self.selector.forget(generation);
        if let Some(committer) = &self.committer {
            committer.retire(generation).await?;
        }
        info!(generation = %generation, "Generation retired");
        Ok(())
    }

    /// Stop dispatching, then drain every generation.
    ///
    /// Returns the first drain failure, after all generations were drained.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx.send_replace(true);
        let entries: Vec<(GenerationId, GenerationEntry)> = {
            let mut generations = self.generations.write().await;
            generations.drain().collect()
        };
        metrics::set_active_generations(0);
        info!(generations = entries.len(), "Shutting down change feed manager");

        let drains = entries
            .into_iter()
            .map(|(generation, entry)| async move { self.drain(&generation, entry).await });
        let results = futures::future::join_all(drains).await;
        results.into_iter().collect::<Result<Vec<()>>>().map(|_| ())
    }

    async fn drain(&self, generation: &GenerationId, entry: GenerationEntry) -> Result<()> {
        let timeout = self.config.initial_sync.shutdown_timeout(entry.kind);
        let GenerationEntry {
            manager,
            mut dispatcher,
            ..
        } = entry;

        let drained = tokio::time::timeout(timeout, async {
            manager.shutdown().await;
            let _ = (&mut dispatcher).await;
        })
        .await;
        self.release(generation);

        match drained {
            Ok(()) => {
                debug!(generation = %generation, "Generation drained");
                Ok(())
            }
            Err(_) => {
                dispatcher.abort();
                warn!(generation = %generation, timeout = ?timeout, "Generation did not drain in time");
                Err(SyncError::transient(format!(
                    "timed out after {timeout:?} draining generation {generation}"
                )))
            }
        }
    }

    /// Drop the schedulers' bookkeeping for a generation that was drained.
    fn release(&self, generation: &GenerationId) {
        self.indexing.forget(generation);
        if let Some(decoding) = &self.decoding {
            decoding.forget(generation);
        }
    }
}

fn already_tailing(generation: &GenerationId) -> SyncError {
    SyncError::transient(format!(
        "generation {generation} is already tailing its change feed"
    ))
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|down| *down).await.is_err();
    if closed {
        futures::future::pending::<()>().await;
    }
}

/// Marks a generation as being added until dropped.
struct Reservation<'a> {
    starting: &'a StdMutex<HashSet<GenerationId>>,
    generation: GenerationId,
}

impl<'a> Reservation<'a> {
    fn take(starting: &'a StdMutex<HashSet<GenerationId>>, generation: &GenerationId) -> Option<Self> {
        let mut reserved = starting.lock().unwrap_or_else(PoisonError::into_inner);
        reserved.insert(generation.clone()).then(|| Self {
            starting,
            generation: generation.clone(),
        })
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.starting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.generation);
    }
}
