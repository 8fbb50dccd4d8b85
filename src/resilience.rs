//! Resilience utilities: retry backoff, jitter, rate-limited warnings, permits.
//!
//! - [`RetryConfig`]: exponential backoff for transient storage failures
//! - [`jittered`]: randomize a TTL so cursors opened together do not expire together
//! - [`RateLimitedWarn`]: token bucket guarding noisy warnings
//! - [`EmbeddingPermits`]: process-wide cap on concurrent embedding-heavy fetches
//!
//! # Example
//!
//! ```rust,no_run
//! use index_replication::resilience::{EmbeddingPermits, RateLimitedWarn};
//! use std::time::Duration;
//!
//! let warn = RateLimitedWarn::new(Duration::from_secs(60));
//! if warn.should_warn() {
//!     // tracing::warn!(...)
//! }
//!
//! let permits = EmbeddingPermits::new(4);
//! if let Some(_permit) = permits.try_acquire() {
//!     // fetch; permit dropped = slot released
//! }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Short retry for SQLITE_BUSY / SQLITE_LOCKED on the checkpoint store.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        10ms
    /// 2        20ms
    /// 3        40ms
    /// 4        80ms
    /// 5        (give up)
    /// ```
    pub fn checkpoint() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
        }
    }

    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay = Duration::from_secs_f64(self.initial_delay.as_secs_f64() * multiplier);

        std::cmp::min(delay, self.max_delay)
    }
}

/// Spread `base` uniformly over `[base * (1 - jitter), base * (1 + jitter)]`.
pub fn jittered(base: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return base;
    }
    let jitter = jitter.min(0.99);
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
    base.mul_f64(factor)
}

// =============================================================================
// Rate-limited warnings
// =============================================================================

/// Lets one warning through per interval.
///
/// Callers still count every occurrence; only the log line is throttled.
pub struct RateLimitedWarn {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimitedWarn {
    pub fn new(interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            Duration::from_nanos(1)
        } else {
            interval
        };
        let quota = Quota::with_period(interval).unwrap_or_else(|| Quota::per_second(nonzero_one()));
        Self {
            limiter: GovLimiter::direct(quota),
        }
    }

    /// `true` at most once per interval.
    pub fn should_warn(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

fn nonzero_one() -> std::num::NonZeroU32 {
    std::num::NonZeroU32::MIN
}

impl std::fmt::Debug for RateLimitedWarn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitedWarn").finish_non_exhaustive()
    }
}

// =============================================================================
// Embedding fetch permits (bulkhead)
// =============================================================================

/// Process-wide limit on concurrent fetches whose indexing calls the
/// embedding service.
///
/// Fail-fast only: a generation that cannot get a permit is rescheduled by
/// the dispatcher instead of blocking a pool slot.
#[derive(Debug, Clone)]
pub struct EmbeddingPermits {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl EmbeddingPermits {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Take a permit if one is free. Dropping the permit releases it.
    pub fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.max_concurrent.saturating_sub(self.available())
    }
}
