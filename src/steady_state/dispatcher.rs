//! Per-generation dispatch loop.
//!
//! Each iteration takes a slot in the shared pool, fetches one feed batch,
//! hands it to the generation's index manager and waits for the indexing
//! future before fetching again. A lifecycle event ends the loop once the
//! batch prefix before it has been indexed.

use super::index_manager::IndexManagerHandle;
use crate::error::{Result, SyncError};
use crate::feed::LifecycleEvent;
use crate::interfaces::FeedClient;
use crate::metrics;
use crate::model::{FeedResumeInfo, GenerationId, IndexKind, Timestamp};
use crate::resilience::EmbeddingPermits;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info};

const SOURCE: &str = "steady_state";

enum Step {
    Continue,
    Finished(SyncError),
}

/// Counts fetches across all generations. Decrements on drop so a
/// cancelled fetch is still accounted for.
struct FetchInFlight<'a>(&'a AtomicUsize);

impl<'a> FetchInFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::set_fetches_in_flight(now);
        Self(counter)
    }
}

impl Drop for FetchInFlight<'_> {
    fn drop(&mut self) {
        let now = self.0.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::set_fetches_in_flight(now);
    }
}

/// Shared state every dispatch loop draws from.
#[derive(Clone)]
pub(crate) struct DispatchPool {
    pub slots: Arc<Semaphore>,
    pub embedding: Option<EmbeddingPermits>,
    pub reschedule_delay: Duration,
    pub optime_log_period: Duration,
    pub fetches_in_flight: Arc<AtomicUsize>,
    pub shutdown: watch::Receiver<bool>,
}

pub(crate) struct Dispatcher {
    generation: GenerationId,
    kind: IndexKind,
    client: Box<dyn FeedClient>,
    manager: IndexManagerHandle,
    resume: watch::Sender<Option<FeedResumeInfo>>,
    pool: DispatchPool,
    last_optime_log: Option<Instant>,
}

impl Dispatcher {
    pub fn new(
        generation: GenerationId,
        kind: IndexKind,
        client: Box<dyn FeedClient>,
        manager: IndexManagerHandle,
        resume: watch::Sender<Option<FeedResumeInfo>>,
        pool: DispatchPool,
    ) -> Self {
        Self {
            generation,
            kind,
            client,
            manager,
            resume,
            pool,
            last_optime_log: None,
        }
    }

    pub async fn run(mut self) {
        let mut lifecycle = self.manager.lifecycle();
        loop {
            if *self.pool.shutdown.borrow() {
                debug!("Dispatcher stopping for shutdown");
                break;
            }
            let outcome = tokio::select! {
                biased;
                _ = lifecycle_completed(&mut lifecycle) => break,
                outcome = self.step() => outcome,
            };
            match outcome {
                Ok(Step::Continue) => {}
                Ok(Step::Finished(error)) => {
                    self.manager.fail_lifecycle(error).await;
                    break;
                }
                Err(error) => {
                    let shutting_down = *self.pool.shutdown.borrow();
                    if !shutting_down && !error.is_shutdown() {
                        metrics::record_unexpected_batch_failure(
                            &self.generation.index_id,
                            error.kind().as_str(),
                        );
                    }
                    self.manager
                        .fail_lifecycle(error.prefer_shutdown(shutting_down))
                        .await;
                    break;
                }
            }
        }
        if let Err(e) = self.client.close().await {
            debug!(error = %e, "Failed to close change feed");
        }
    }

    async fn step(&mut self) -> Result<Step> {
        let slot = Arc::clone(&self.pool.slots)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::ShutDown)?;

        // Released when the step returns, after the batch is indexed.
        let _embedding_permit = if self.kind.is_auto_embedding() {
            match &self.pool.embedding {
                Some(permits) => match permits.try_acquire() {
                    Some(permit) => Some(permit),
                    None => {
                        drop(slot);
                        metrics::record_embedding_fetch_rescheduled(&self.generation.index_id);
                        debug!(
                            delay = ?self.pool.reschedule_delay,
                            "No embedding permit available, rescheduling fetch"
                        );
                        tokio::time::sleep(self.pool.reschedule_delay).await;
                        return Ok(Step::Continue);
                    }
                },
                None => None,
            }
        } else {
            None
        };

        let started = Instant::now();
        let batch = {
            let _in_flight = FetchInFlight::enter(&self.pool.fetches_in_flight);
            self.client.next_batch().await?
        };
        let index_id = &self.generation.index_id;
        metrics::record_feed_batch(index_id, SOURCE, batch.len(), batch.byte_size(), started.elapsed());
        if !batch.is_empty() {
            metrics::record_replication_lag(index_id, batch.operation_time.lag_until(wall_clock()));
        }

        let scheduled = self.manager.index_batch(batch).await?;
        drop(slot);
        scheduled.future.await?;

        if let Some(info) = scheduled.resume {
            self.publish(info);
        }
        match scheduled.lifecycle {
            None => Ok(Step::Continue),
            Some(lifecycle) => Ok(self.finish(lifecycle)),
        }
    }

    fn finish(&self, lifecycle: LifecycleEvent) -> Step {
        metrics::record_lifecycle_event(&self.generation.index_id, lifecycle.label());
        info!(lifecycle = lifecycle.label(), "Change feed reached a lifecycle event");
        let error = lifecycle
            .into_error()
            .unwrap_or_else(|| SyncError::requires_resync("unexpected lifecycle notification"));
        Step::Finished(error)
    }

    /// Publish `info` unless a later position is already out.
    fn publish(&mut self, info: FeedResumeInfo) {
        let time = info.operation_time;
        let token = info.resume_token.clone();
        self.resume.send_if_modified(|current| {
            if matches!(current, Some(c) if c.operation_time > info.operation_time) {
                return false;
            }
            *current = Some(info);
            true
        });

        let due = self
            .last_optime_log
            .map_or(true, |at| at.elapsed() >= self.pool.optime_log_period);
        if due {
            self.last_optime_log = Some(Instant::now());
            debug!(optime = %time, token = token.as_str(), "Applied change feed batch");
        }
    }
}

async fn lifecycle_completed(lifecycle: &mut watch::Receiver<Option<SyncError>>) {
    let _ = lifecycle.wait_for(Option::is_some).await;
}

fn wall_clock() -> Timestamp {
    let seconds = u32::try_from(chrono::Utc::now().timestamp()).unwrap_or(u32::MAX);
    Timestamp::new(seconds, 0)
}
