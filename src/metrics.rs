//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Witnessed / applicable document mutations
//! - Skipped key-less records
//! - Scan and feed batch sizes and durations
//! - Feed cursor restarts and embedding fetch gating
//! - Replication lag
//! - Lifecycle events and unexpected batch failures
//! - Checkpoint commits
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Per-index metrics carry an `index_id` label.
//!
//! # Usage
//!
//! ```rust,no_run
//! use index_replication::metrics;
//! use std::time::Duration;
//!
//! // After preprocessing a feed batch
//! metrics::record_updates("idx-1", "steady_state", 42, 40);
//!
//! // After a scan page was fetched
//! metrics::record_scan_batch("idx-1", 500, Duration::from_millis(80));
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record mutations seen and mutations that produced index work.
pub fn record_updates(index_id: &str, source: &'static str, witnessed: usize, applicable: usize) {
    counter!("replication_witnessed_updates_total", "index_id" => index_id.to_string(), "source" => source)
        .increment(witnessed as u64);
    counter!("replication_applicable_updates_total", "index_id" => index_id.to_string(), "source" => source)
        .increment(applicable as u64);
}

/// Record records skipped because their key was missing or unusable.
pub fn record_skipped_keyless(index_id: &str, count: usize) {
    if count > 0 {
        counter!("replication_skipped_keyless_records_total", "index_id" => index_id.to_string())
            .increment(count as u64);
    }
}

/// Record one collection scan page.
pub fn record_scan_batch(index_id: &str, documents: usize, duration: Duration) {
    histogram!("replication_scan_batch_size", "index_id" => index_id.to_string()).record(documents as f64);
    histogram!("replication_scan_batch_duration_seconds", "index_id" => index_id.to_string())
        .record(duration.as_secs_f64());
}

/// Record one change-feed fetch.
pub fn record_feed_batch(index_id: &str, source: &'static str, events: usize, bytes: usize, duration: Duration) {
    histogram!("replication_feed_batch_size", "index_id" => index_id.to_string(), "source" => source)
        .record(events as f64);
    histogram!("replication_feed_batch_bytes", "index_id" => index_id.to_string(), "source" => source)
        .record(bytes as f64);
    histogram!("replication_feed_batch_duration_seconds", "index_id" => index_id.to_string(), "source" => source)
        .record(duration.as_secs_f64());
}

/// Record time spent classifying and converting a feed batch.
pub fn record_preprocessing(index_id: &str, duration: Duration) {
    histogram!("replication_preprocessing_duration_seconds", "index_id" => index_id.to_string())
        .record(duration.as_secs_f64());
}

/// Set the number of feed fetches currently in flight (process-wide).
pub fn set_fetches_in_flight(count: usize) {
    gauge!("replication_feed_fetches_in_flight").set(count as f64);
}

/// Record a generation rescheduled because no embedding permit was free.
pub fn record_embedding_fetch_rescheduled(index_id: &str) {
    counter!("replication_embedding_fetch_rescheduled_total", "index_id" => index_id.to_string()).increment(1);
}

/// Record a batch failure that was not part of a shutdown.
pub fn record_unexpected_batch_failure(index_id: &str, kind: &'static str) {
    counter!("replication_unexpected_batch_failures_total", "index_id" => index_id.to_string(), "kind" => kind)
        .increment(1);
}

/// Record a lifecycle event (drop, rename, invalidate, ...).
pub fn record_lifecycle_event(index_id: &str, label: &'static str) {
    counter!("replication_lifecycle_events_total", "index_id" => index_id.to_string(), "event" => label)
        .increment(1);
}

/// Record a typed error ending an initial sync or a generation.
pub fn record_sync_error(index_id: &str, phase: &'static str, kind: &'static str) {
    counter!(
        "replication_sync_errors_total",
        "index_id" => index_id.to_string(),
        "phase" => phase,
        "kind" => kind
    )
    .increment(1);
}

/// Record replication lag behind the source's majority-committed time.
pub fn record_replication_lag(index_id: &str, lag: Duration) {
    gauge!("replication_lag_seconds", "index_id" => index_id.to_string()).set(lag.as_secs_f64());
}

/// Set the number of batches waiting in a scheduler.
pub fn set_queued_batches(scheduler: &'static str, count: usize) {
    gauge!("replication_queued_batches", "scheduler" => scheduler).set(count as f64);
}

/// Set the number of generations tailing the feed.
pub fn set_active_generations(count: usize) {
    gauge!("replication_active_generations").set(count as f64);
}

/// Record a feed cursor restart.
pub fn record_feed_restart(reason: &'static str) {
    counter!("replication_feed_restarts_total", "reason" => reason).increment(1);
}

/// Record a checkpoint commit.
pub fn record_checkpoint_commit(index_id: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_checkpoint_commits_total", "index_id" => index_id.to_string(), "status" => status)
        .increment(1);
}

/// Record a checkpoint that would have moved the feed position backwards.
pub fn record_checkpoint_rejected(index_id: &str) {
    counter!("replication_checkpoint_rejections_total", "index_id" => index_id.to_string()).increment(1);
}

/// Record checkpoint SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn checkpoint_retries_total(operation: &'static str) {
    counter!("replication_checkpoint_retries_total", "operation" => operation).increment(1);
}

/// Record an initial sync phase transition.
pub fn record_initial_sync_phase(index_id: &str, phase: &'static str) {
    counter!("replication_initial_sync_phases_total", "index_id" => index_id.to_string(), "phase" => phase)
        .increment(1);
}
