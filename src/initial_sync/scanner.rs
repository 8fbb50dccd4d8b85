//! Time-bounded collection scanning.
//!
//! One [`CollectionScanner::scan`] call is one scan round: open a scan
//! cursor at the current position, page through the collection until the
//! wall-clock budget is spent or the collection is exhausted, and close the
//! cursor.
//!
//! # Pipelining
//!
//! ```text
//! fetch(1) ─ schedule(1) ─ fetch(2) ─ await(1) ─ schedule(2) ─ fetch(3) ─ await(2) ─ ...
//! ```
//!
//! At most one page is being indexed while the next one is fetched. The
//! scan position moves only once a page carrying a new position has been
//! scheduled, and it rides along with that page as commit metadata.

use super::context::SyncContext;
use super::diff_scanner::DiffScanner;
use crate::batch::DocumentEventBatch;
use crate::error::Result;
use crate::interfaces::{BatchFuture, ScanClient, ScanPage, ScanRequest};
use crate::metrics;
use crate::model::{CommitMetadata, Priority, ScanMode, ScanPosition, Timestamp};
use std::ops::Bound;
use std::time::{Duration, Instant};
use tracing::{debug, info_span, Instrument};

/// Result of one scan round.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScanOutcome {
    /// The budget ran out before the collection was exhausted.
    pub more_to_scan: bool,
    pub position: ScanPosition,
}

/// A page turned into index work.
struct PreparedPage {
    batch: DocumentEventBatch,
    /// Position after this page, when the page carries one.
    position: Option<ScanPosition>,
}

impl PreparedPage {
    fn needs_scheduling(&self) -> bool {
        !self.batch.is_empty() || self.position.is_some()
    }
}

pub(crate) struct CollectionScanner<'a> {
    ctx: &'a SyncContext,
    position: ScanPosition,
    diff: Option<DiffScanner>,
}

impl<'a> CollectionScanner<'a> {
    pub fn new(ctx: &'a SyncContext, position: ScanPosition, diff: Option<DiffScanner>) -> Self {
        Self { ctx, position, diff }
    }

    /// Run one scan round of at most `budget`.
    ///
    /// `high_water_mark` is the feed position already applied; it is
    /// recorded with every scheduled page. On failure all scheduled work
    /// of the attempt is cancelled and drained before the error returns.
    pub async fn scan(&mut self, budget: Duration, high_water_mark: Timestamp) -> Result<ScanOutcome> {
        let ctx = self.ctx;
        let span = info_span!(
            "collection_scan",
            index_id = %ctx.index_id(),
            generation = ctx.generation.generation
        );

        async move {
            match self.scan_round(budget, high_water_mark).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => Err(ctx.unwind(e).await),
            }
        }
        .instrument(span)
        .await
    }

    async fn scan_round(&mut self, budget: Duration, high_water_mark: Timestamp) -> Result<ScanOutcome> {
        let ctx = self.ctx;
        let deadline = Instant::now() + budget;
        debug!(position = ?self.position, "Opening scan");

        let mut client = ctx
            .source
            .open_scan(ScanRequest {
                namespace: ctx.namespace.clone(),
                position: self.position.clone(),
                preferred_host: ctx.sync_source_host.clone(),
            })
            .await?;

        match self.drain(client.as_mut(), deadline, high_water_mark).await {
            Ok(outcome) => {
                client.close().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(close_err) = client.close().await {
                    debug!(error = %close_err, "Failed to close scan cursor");
                }
                Err(e)
            }
        }
    }

    async fn drain(
        &mut self,
        client: &mut dyn ScanClient,
        deadline: Instant,
        high_water_mark: Timestamp,
    ) -> Result<ScanOutcome> {
        let ctx = self.ctx;
        let mut previous: Option<BatchFuture> = None;
        let mut pages = 0usize;
        let mut more_to_scan = false;

        loop {
            ctx.check_shutdown()?;

            if !client.has_next() {
                // A diff scan that resumed right at the end still owes the
                // deletes for view entries past the last scanned key.
                if pages == 0 && self.diff.is_some() {
                    let prepared = self.prepare(ScanPage::default(), false).await?;
                    if let Some(f) = self.schedule(prepared, high_water_mark) {
                        previous = Some(f);
                    }
                }
                break;
            }
            if Instant::now() >= deadline {
                more_to_scan = true;
                break;
            }

            let fetch_start = Instant::now();
            let page = client.next_page().await?;
            metrics::record_scan_batch(ctx.index_id(), page.documents.len(), fetch_start.elapsed());
            pages += 1;

            if let Some(f) = previous.take() {
                f.await?;
            }

            let prepared = self.prepare(page, client.has_next()).await?;
            metrics::record_updates(
                ctx.index_id(),
                "initial_sync_scan",
                prepared.batch.witnessed,
                prepared.batch.applicable,
            );
            ctx.record_skipped(prepared.batch.skipped_keyless);

            if let Some(f) = self.schedule(prepared, high_water_mark) {
                previous = Some(f);
            }
        }

        if let Some(f) = previous {
            f.await?;
        }

        debug!(pages, more_to_scan, position = ?self.position, "Scan round finished");
        Ok(ScanOutcome {
            more_to_scan,
            position: self.position.clone(),
        })
    }

    async fn prepare(&self, page: ScanPage, more_pages: bool) -> Result<PreparedPage> {
        if let Some(diff) = &self.diff {
            let lower = match self.position.key() {
                Some(key) => Bound::Excluded(key.clone()),
                None => Bound::Unbounded,
            };
            let diffed = diff.diff_page(page.documents, lower, more_pages).await?;
            return Ok(PreparedPage {
                batch: diffed.batch,
                position: diffed.last_key.map(|key| ScanPosition::Key(Some(key))),
            });
        }

        let token = page.post_batch_token;
        let batch = DocumentEventBatch::from_scan_page(page.documents);
        // An empty page carries no safe position in natural order.
        let position = if batch.is_empty() {
            None
        } else {
            match self.position.mode() {
                ScanMode::KeyOrder => batch
                    .events
                    .last()
                    .map(|event| ScanPosition::Key(Some(event.key.clone()))),
                ScanMode::NaturalOrder => token.map(|t| ScanPosition::Natural(Some(t))),
            }
        };
        Ok(PreparedPage { batch, position })
    }

    fn schedule(&mut self, prepared: PreparedPage, high_water_mark: Timestamp) -> Option<BatchFuture> {
        if !prepared.needs_scheduling() {
            return None;
        }
        let position = prepared.position.unwrap_or_else(|| self.position.clone());
        let metadata = CommitMetadata::initial_sync(self.ctx.resume_info(high_water_mark, position.clone()));
        let future = self
            .ctx
            .schedule(prepared.batch.events, Priority::InitialSyncScan, Some(metadata));
        self.position = position;
        Some(future)
    }
}
