//! State shared by the scanner and the applier of one initial sync attempt.

use super::types::InitialSyncPhase;
use crate::error::{Result, SyncError};
use crate::interfaces::{BatchFuture, IndexingScheduler, SourceClient};
use crate::batch::DocumentEvent;
use crate::metrics;
use crate::model::{
    AttemptId, CommitMetadata, GenerationId, IndexDefinition, InitialSyncResumeInfo, Namespace,
    Priority, ScanPosition, Timestamp,
};
use crate::resilience::RateLimitedWarn;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Publish `phase` to observers if it differs from the current one.
pub(crate) fn publish_phase(
    tx: &watch::Sender<InitialSyncPhase>,
    index_id: &str,
    phase: InitialSyncPhase,
) {
    let changed = tx.send_if_modified(|current| {
        if *current == phase {
            false
        } else {
            *current = phase;
            true
        }
    });
    if changed {
        debug!(phase = %phase, "Initial sync phase");
        metrics::record_initial_sync_phase(index_id, phase.as_str());
    }
}

pub(crate) struct SyncContext {
    pub generation: GenerationId,
    pub attempt: AttemptId,
    pub definition: IndexDefinition,
    pub namespace: Namespace,
    pub source: Arc<dyn SourceClient>,
    pub scheduler: Arc<dyn IndexingScheduler>,
    pub skipped_warn: Arc<RateLimitedWarn>,
    /// Host recorded in resume metadata and preferred when opening cursors.
    pub sync_source_host: Option<String>,
    pub shutdown: watch::Receiver<bool>,
    pub phase: Arc<watch::Sender<InitialSyncPhase>>,
}

impl SyncContext {
    pub fn index_id(&self) -> &str {
        &self.generation.index_id
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Iteration-boundary shutdown check.
    pub fn check_shutdown(&self) -> Result<()> {
        if self.is_shutting_down() {
            Err(SyncError::ShutDown)
        } else {
            Ok(())
        }
    }

    pub fn set_phase(&self, phase: InitialSyncPhase) {
        publish_phase(&self.phase, self.index_id(), phase);
    }

    pub fn resume_info(&self, high_water_mark: Timestamp, last_scanned: ScanPosition) -> InitialSyncResumeInfo {
        InitialSyncResumeInfo {
            high_water_mark,
            last_scanned,
            sync_source_host: self.sync_source_host.clone(),
        }
    }

    pub fn schedule(
        &self,
        events: Vec<DocumentEvent>,
        priority: Priority,
        metadata: Option<CommitMetadata>,
    ) -> BatchFuture {
        self.scheduler
            .schedule(&self.generation, self.attempt, events, priority, metadata)
    }

    /// Count skipped key-less records, warning at most once per interval.
    pub fn record_skipped(&self, count: usize) {
        if count == 0 {
            return;
        }
        metrics::record_skipped_keyless(self.index_id(), count);
        if self.skipped_warn.should_warn() {
            warn!(
                count,
                "Skipping documents without a usable key, likely a corrupted projection"
            );
        }
    }

    /// Cancel this attempt's scheduled work and wait for it to drain.
    ///
    /// Returns the error to propagate, collapsed to `ShutDown` when a
    /// shutdown was requested.
    pub async fn unwind(&self, error: SyncError) -> SyncError {
        let error = error.prefer_shutdown(self.is_shutting_down());
        if let Err(e) = self
            .scheduler
            .cancel(&self.generation, self.attempt, error.clone())
            .await
        {
            warn!(error = %e, "Failure during indexing cancellation");
        }
        error
    }
}
