//! Restarting feed-client decorators.
//!
//! Both wrappers proxy a fetch, then check a switch condition; when it
//! holds, the cursor is closed and reopened just after the fetched batch's
//! post-batch token, so the caller sees one uninterrupted stream.
//!
//! ```text
//! TimedFeedClient            restart when uptime > jittered TTL
//!   └── ModeAwareFeedClient  restart when the selected projection changes
//!         └── raw cursor     SourceClient::open_feed
//! ```
//!
//! A failed restart surfaces on the fetch that triggered it. A failed mode
//! refresh is only logged; the cursor keeps its current projection.

use crate::error::Result;
use crate::feed::FeedBatch;
use crate::interfaces::{BoxFuture, FeedClient, FeedRequest, FeedStart, ModeSelector, SourceClient};
use crate::metrics;
use crate::model::{GenerationId, Namespace, ProjectionMode, ResumeToken};
use crate::resilience::jittered;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A feed cursor that can be reopened after a token.
pub trait RestartableFeed: FeedClient {
    fn restart_after(&mut self, token: ResumeToken, reason: &'static str) -> BoxFuture<'_, ()>;
}

/// Reopens the cursor whenever the selector's projection for the generation
/// differs from the one the cursor was opened with.
pub struct ModeAwareFeedClient {
    source: Arc<dyn SourceClient>,
    selector: Arc<dyn ModeSelector>,
    generation: GenerationId,
    namespace: Namespace,
    preferred_host: Option<String>,
    mode: ProjectionMode,
    inner: Box<dyn FeedClient>,
    refresh_period: Option<Duration>,
    refreshed_at: Option<Instant>,
}

impl ModeAwareFeedClient {
    /// Open a cursor with the currently selected projection.
    pub async fn open(
        source: Arc<dyn SourceClient>,
        selector: Arc<dyn ModeSelector>,
        generation: GenerationId,
        namespace: Namespace,
        start: FeedStart,
    ) -> Result<Self> {
        let mode = selector.mode(&generation);
        let preferred_host = source.sync_source_host();
        let request = FeedRequest {
            namespace: namespace.clone(),
            start,
            projection: mode,
            preferred_host: preferred_host.clone(),
        };
        let inner = source.open_feed(request).await?;
        Ok(Self {
            source,
            selector,
            generation,
            namespace,
            preferred_host,
            mode,
            inner,
            refresh_period: None,
            refreshed_at: None,
        })
    }

    /// Ask the selector to re-sample at the first batch and then at most
    /// once per `period`.
    pub fn with_refresh_period(mut self, period: Duration) -> Self {
        self.refresh_period = Some(period);
        self
    }

    pub fn mode(&self) -> ProjectionMode {
        self.mode
    }

    async fn refresh_if_due(&mut self) {
        let Some(period) = self.refresh_period else {
            return;
        };
        if self.refreshed_at.is_some_and(|at| at.elapsed() < period) {
            return;
        }
        self.refreshed_at = Some(Instant::now());
        if let Err(e) = self
            .selector
            .refresh(&self.generation, self.source.as_ref(), &self.namespace)
            .await
        {
            warn!(generation = %self.generation, error = %e, "Projection mode refresh failed");
        }
    }

    async fn reopen(&mut self, token: ResumeToken, mode: ProjectionMode, reason: &'static str) -> Result<()> {
        if let Err(e) = self.inner.close().await {
            debug!(error = %e, "Failed to close change feed before restart");
        }
        let request = FeedRequest::after(self.namespace.clone(), token)
            .with_projection(mode)
            .with_preferred_host(self.preferred_host.clone());
        self.inner = self.source.open_feed(request).await?;
        self.mode = mode;
        metrics::record_feed_restart(reason);
        Ok(())
    }
}

impl FeedClient for ModeAwareFeedClient {
    fn next_batch(&mut self) -> BoxFuture<'_, FeedBatch> {
        Box::pin(async move {
            let batch = self.inner.next_batch().await?;
            self.refresh_if_due().await;
            let desired = self.selector.mode(&self.generation);
            if desired != self.mode {
                info!(from = ?self.mode, to = ?desired, "Switching change feed projection");
                self.reopen(batch.post_batch_token.clone(), desired, "mode_change")
                    .await?;
            }
            Ok(batch)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.inner.close()
    }
}

impl RestartableFeed for ModeAwareFeedClient {
    fn restart_after(&mut self, token: ResumeToken, reason: &'static str) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mode = self.selector.mode(&self.generation);
            self.reopen(token, mode, reason).await
        })
    }
}

/// Reopens the cursor once it has been open longer than a jittered TTL.
pub struct TimedFeedClient<F> {
    inner: F,
    max_age: Duration,
    jitter: f64,
    ttl: Duration,
    opened_at: Instant,
}

impl<F: RestartableFeed> TimedFeedClient<F> {
    pub fn new(inner: F, max_age: Duration, jitter: f64) -> Self {
        Self {
            inner,
            max_age,
            jitter,
            ttl: jittered(max_age, jitter),
            opened_at: Instant::now(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn inner(&self) -> &F {
        &self.inner
    }
}

impl<F: RestartableFeed> FeedClient for TimedFeedClient<F> {
    fn next_batch(&mut self) -> BoxFuture<'_, FeedBatch> {
        Box::pin(async move {
            let batch = self.inner.next_batch().await?;
            let uptime = self.opened_at.elapsed();
            if uptime > self.ttl {
                debug!(uptime = ?uptime, ttl = ?self.ttl, "Change feed cursor expired, restarting");
                self.inner
                    .restart_after(batch.post_batch_token.clone(), "ttl")
                    .await?;
                self.opened_at = Instant::now();
                self.ttl = jittered(self.max_age, self.jitter);
            }
            Ok(batch)
        })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        self.inner.close()
    }
}
