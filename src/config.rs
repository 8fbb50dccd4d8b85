//! Configuration for the replication engine.
//!
//! All tunables for initial sync, steady-state tailing, the in-process work
//! schedulers and checkpoint persistence. Configuration can be constructed
//! programmatically or deserialized from YAML/JSON by the embedding service.
//!
//! # Quick Start
//!
//! ```rust
//! use index_replication::config::{ReplicationConfig, SteadyStateConfig};
//!
//! let config = ReplicationConfig {
//!     steady_state: SteadyStateConfig {
//!         num_concurrent_change_feeds: 4,
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── initial_sync: InitialSyncConfig    # scan budget, catch-up, lag, drain timeouts
//! ├── steady_state: SteadyStateConfig    # feed concurrency, cursor TTL, embedding gate
//! ├── scheduler: SchedulerConfig         # indexing / decoding worker counts
//! ├── checkpoint: CheckpointConfig       # SQLite resume metadata store
//! └── skipped_record_warn_interval       # rate limit for key-less record warnings
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! initial_sync:
//!   collection_scan_time: "10s"
//!   catchup_timeout: "30s"
//!   max_lag: "5s"
//!   sync_source_policy: pinned
//!
//! steady_state:
//!   num_concurrent_change_feeds: 10
//!   cursor_max_age: "30m"
//!   max_in_flight_embedding_fetches: 4
//!   mode_refresh_period: "5m"
//!
//! checkpoint:
//!   sqlite_path: "/var/lib/search/replication.db"
//! ```

use crate::model::IndexKind;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime duration string, falling back when it is malformed.
fn parse_or(value: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(fallback)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object handed to the replication managers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default)]
    pub initial_sync: InitialSyncConfig,

    #[serde(default)]
    pub steady_state: SteadyStateConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Minimum interval between "skipped key-less record" warnings.
    #[serde(default = "default_skipped_record_warn_interval")]
    pub skipped_record_warn_interval: String,
}

fn default_skipped_record_warn_interval() -> String {
    "1m".to_string()
}

impl ReplicationConfig {
    /// Small budgets and an in-memory store, for tests.
    pub fn for_testing() -> Self {
        Self {
            initial_sync: InitialSyncConfig::for_testing(),
            steady_state: SteadyStateConfig::for_testing(),
            scheduler: SchedulerConfig::for_testing(),
            checkpoint: CheckpointConfig::in_memory(),
            skipped_record_warn_interval: "1m".to_string(),
        }
    }

    pub fn skipped_record_warn_interval(&self) -> Duration {
        parse_or(&self.skipped_record_warn_interval, Duration::from_secs(60))
    }

    /// Reject values that would wedge the engine.
    pub fn validate(&self) -> Result<(), String> {
        if self.steady_state.num_concurrent_change_feeds == 0 {
            return Err("steady_state.num_concurrent_change_feeds must be > 0".into());
        }
        if self.steady_state.max_in_flight_embedding_fetches == Some(0) {
            return Err("steady_state.max_in_flight_embedding_fetches must be > 0 when set".into());
        }
        if !(0.0..1.0).contains(&self.steady_state.cursor_max_age_jitter) {
            return Err("steady_state.cursor_max_age_jitter must be in [0, 1)".into());
        }
        if self.scheduler.num_indexing_workers == 0 {
            return Err("scheduler.num_indexing_workers must be > 0".into());
        }
        if self.scheduler.num_decoding_workers == 0 {
            return Err("scheduler.num_decoding_workers must be > 0".into());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// InitialSyncConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Whether a resumed initial sync sticks to the host it started on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSourcePolicy {
    /// Record the sync-source host and prefer it on resume.
    #[default]
    Pinned,
    /// Let the source client pick any eligible host.
    Rebalance,
}

/// Initial sync (scan + catch-up tailing) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitialSyncConfig {
    /// Wall-clock budget for one scan round before switching to catch-up.
    #[serde(default = "default_collection_scan_time")]
    pub collection_scan_time: String,

    /// Upper bound on the optional lag-reduction phase.
    #[serde(default = "default_catchup_timeout")]
    pub catchup_timeout: String,

    /// Lag at which the lag-reduction phase may stop early.
    #[serde(default = "default_max_lag")]
    pub max_lag: String,

    #[serde(default)]
    pub sync_source_policy: SyncSourcePolicy,

    /// Drain timeout for ordinary indexes.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    /// Drain timeout for indexes that call the embedding service.
    #[serde(default = "default_auto_embedding_shutdown_timeout")]
    pub auto_embedding_shutdown_timeout: String,
}

fn default_collection_scan_time() -> String {
    "10s".to_string()
}

fn default_catchup_timeout() -> String {
    "30s".to_string()
}

fn default_max_lag() -> String {
    "5s".to_string()
}

fn default_shutdown_timeout() -> String {
    "30s".to_string()
}

fn default_auto_embedding_shutdown_timeout() -> String {
    "5m".to_string()
}

impl Default for InitialSyncConfig {
    fn default() -> Self {
        Self {
            collection_scan_time: default_collection_scan_time(),
            catchup_timeout: default_catchup_timeout(),
            max_lag: default_max_lag(),
            sync_source_policy: SyncSourcePolicy::Pinned,
            shutdown_timeout: default_shutdown_timeout(),
            auto_embedding_shutdown_timeout: default_auto_embedding_shutdown_timeout(),
        }
    }
}

impl InitialSyncConfig {
    pub fn for_testing() -> Self {
        Self {
            collection_scan_time: "200ms".to_string(),
            catchup_timeout: "200ms".to_string(),
            max_lag: "1s".to_string(),
            sync_source_policy: SyncSourcePolicy::Pinned,
            shutdown_timeout: "2s".to_string(),
            auto_embedding_shutdown_timeout: "4s".to_string(),
        }
    }

    pub fn collection_scan_time(&self) -> Duration {
        parse_or(&self.collection_scan_time, Duration::from_secs(10))
    }

    pub fn catchup_timeout(&self) -> Duration {
        parse_or(&self.catchup_timeout, Duration::from_secs(30))
    }

    pub fn max_lag(&self) -> Duration {
        parse_or(&self.max_lag, Duration::from_secs(5))
    }

    /// Drain timeout for the given index kind.
    pub fn shutdown_timeout(&self, kind: IndexKind) -> Duration {
        if kind.is_auto_embedding() {
            parse_or(&self.auto_embedding_shutdown_timeout, Duration::from_secs(300))
        } else {
            parse_or(&self.shutdown_timeout, Duration::from_secs(30))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SteadyStateConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Steady-state change-feed tailing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteadyStateConfig {
    /// Width of the dispatcher pool: generations fetched concurrently.
    #[serde(default = "default_num_concurrent_change_feeds")]
    pub num_concurrent_change_feeds: usize,

    /// Base TTL after which a feed cursor is proactively reopened.
    #[serde(default = "default_cursor_max_age")]
    pub cursor_max_age: String,

    /// Relative jitter applied to `cursor_max_age` (0.1 = ±10%).
    #[serde(default = "default_cursor_max_age_jitter")]
    pub cursor_max_age_jitter: f64,

    /// Process-wide cap on concurrent auto-embedding fetches. Unset = no cap.
    #[serde(default)]
    pub max_in_flight_embedding_fetches: Option<usize>,

    /// Delay before retrying a generation that could not get an embedding permit.
    #[serde(default = "default_embedding_reschedule_delay")]
    pub embedding_reschedule_delay: String,

    /// Decode feed batches on the decoding scheduler instead of inline.
    #[serde(default)]
    pub use_decoding_executor: bool,

    /// Minimum interval between applied op-time debug logs.
    #[serde(default = "default_optime_log_period")]
    pub optime_log_period: String,

    /// How often a tailing feed asks the mode selector to re-sample.
    #[serde(default = "default_mode_refresh_period")]
    pub mode_refresh_period: String,

    /// Upper bound on resolving the collection and opening its feed in `add`.
    #[serde(default = "default_feed_open_timeout")]
    pub feed_open_timeout: String,
}

fn default_num_concurrent_change_feeds() -> usize {
    10
}

fn default_cursor_max_age() -> String {
    "30m".to_string()
}

fn default_cursor_max_age_jitter() -> f64 {
    0.1
}

fn default_embedding_reschedule_delay() -> String {
    "1s".to_string()
}

fn default_optime_log_period() -> String {
    "1m".to_string()
}

fn default_mode_refresh_period() -> String {
    "5m".to_string()
}

fn default_feed_open_timeout() -> String {
    "30s".to_string()
}

impl Default for SteadyStateConfig {
    fn default() -> Self {
        Self {
            num_concurrent_change_feeds: default_num_concurrent_change_feeds(),
            cursor_max_age: default_cursor_max_age(),
            cursor_max_age_jitter: default_cursor_max_age_jitter(),
            max_in_flight_embedding_fetches: None,
            embedding_reschedule_delay: default_embedding_reschedule_delay(),
            use_decoding_executor: false,
            optime_log_period: default_optime_log_period(),
            mode_refresh_period: default_mode_refresh_period(),
            feed_open_timeout: default_feed_open_timeout(),
        }
    }
}

impl SteadyStateConfig {
    pub fn for_testing() -> Self {
        Self {
            num_concurrent_change_feeds: 2,
            embedding_reschedule_delay: "20ms".to_string(),
            ..Self::default()
        }
    }

    pub fn cursor_max_age(&self) -> Duration {
        parse_or(&self.cursor_max_age, Duration::from_secs(30 * 60))
    }

    pub fn embedding_reschedule_delay(&self) -> Duration {
        parse_or(&self.embedding_reschedule_delay, Duration::from_secs(1))
    }

    pub fn optime_log_period(&self) -> Duration {
        parse_or(&self.optime_log_period, Duration::from_secs(60))
    }

    pub fn mode_refresh_period(&self) -> Duration {
        parse_or(&self.mode_refresh_period, Duration::from_secs(5 * 60))
    }

    pub fn feed_open_timeout(&self) -> Duration {
        parse_or(&self.feed_open_timeout, Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SchedulerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Worker counts for the in-process schedulers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_num_indexing_workers")]
    pub num_indexing_workers: usize,

    #[serde(default = "default_num_decoding_workers")]
    pub num_decoding_workers: usize,
}

fn default_num_indexing_workers() -> usize {
    4
}

fn default_num_decoding_workers() -> usize {
    2
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_indexing_workers: default_num_indexing_workers(),
            num_decoding_workers: default_num_decoding_workers(),
        }
    }
}

impl SchedulerConfig {
    pub fn for_testing() -> Self {
        Self {
            num_indexing_workers: 2,
            num_decoding_workers: 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CheckpointConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Resume metadata persistence.
///
/// Metadata normally rides along with the index commit; the SQLite store is
/// the reference committer used when the index engine has no metadata slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_true() -> bool {
    true
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            sqlite_path: "replication_checkpoints.db".to_string(),
            wal_mode: true,
        }
    }
}

impl CheckpointConfig {
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
