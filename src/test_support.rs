//! Scripted collaborators for unit tests.

use crate::batch::DocumentEvent;
use crate::error::{Result, SyncError};
use crate::feed::{FeedBatch, FeedEvent};
use crate::interfaces::{
    BatchFuture, BoxFuture, CollectionStats, FeedClient, FeedRequest, IndexingScheduler,
    ScanClient, ScanPage, ScanRequest, SourceClient,
};
use crate::model::{
    AttemptId, CommitMetadata, Document, GenerationId, IndexDefinition, Namespace, Priority,
    ResumeToken, Timestamp,
};
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub(crate) fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

pub(crate) fn ns() -> Namespace {
    Namespace::new("db", "coll")
}

pub(crate) fn ready_batch() -> BatchFuture {
    let fut: BoxFuture<'static, ()> = Box::pin(async { Ok(()) });
    fut.shared()
}

#[derive(Default)]
pub(crate) struct SourceState {
    pub pages: VecDeque<ScanPage>,
    pub feed: VecDeque<Result<FeedBatch>>,
    pub committed: Timestamp,
    /// `None` means the collection was dropped.
    pub collection: Option<String>,
    pub host: Option<String>,
    pub scan_requests: Vec<ScanRequest>,
    pub feed_requests: Vec<FeedRequest>,
    pub feed_fetches: usize,
    pub page_fetches: usize,
    pub stats: Option<CollectionStats>,
    pub stats_requests: usize,
    /// Opening a feed never completes.
    pub hang_open_feed: bool,
}

/// Source whose scan pages and feed batches are scripted up front.
///
/// Once the scripted feed runs dry, every fetch returns an empty batch at
/// the current committed time.
#[derive(Clone)]
pub(crate) struct ScriptedSource {
    pub state: Arc<Mutex<SourceState>>,
}

impl ScriptedSource {
    pub fn new(committed: Timestamp) -> Self {
        Self {
            state: Arc::new(Mutex::new(SourceState {
                committed,
                collection: Some(ns().collection),
                ..SourceState::default()
            })),
        }
    }

    pub fn with_pages(self, pages: Vec<Vec<Document>>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            for documents in pages {
                state.pages.push_back(ScanPage {
                    documents,
                    post_batch_token: None,
                });
            }
        }
        self
    }

    pub fn push_page(&self, page: ScanPage) {
        self.state.lock().unwrap().pages.push_back(page);
    }

    pub fn push_feed(&self, events: &[FeedEvent], token: &str, operation_time: Timestamp) {
        self.state
            .lock()
            .unwrap()
            .feed
            .push_back(Ok(FeedBatch::from_events(events, token, operation_time)));
    }

    pub fn set_committed(&self, time: Timestamp) {
        self.state.lock().unwrap().committed = time;
    }

    pub fn set_collection(&self, name: Option<&str>) {
        self.state.lock().unwrap().collection = name.map(str::to_string);
    }

    pub fn set_stats(&self, stats: Option<CollectionStats>) {
        self.state.lock().unwrap().stats = stats;
    }

    pub fn hang_open_feed(&self) {
        self.state.lock().unwrap().hang_open_feed = true;
    }

    pub fn feed_requests(&self) -> Vec<FeedRequest> {
        self.state.lock().unwrap().feed_requests.clone()
    }

    pub fn scan_requests(&self) -> Vec<ScanRequest> {
        self.state.lock().unwrap().scan_requests.clone()
    }
}

struct ScriptedScan {
    state: Arc<Mutex<SourceState>>,
}

impl ScanClient for ScriptedScan {
    fn next_page(&mut self) -> BoxFuture<'_, ScanPage> {
        let mut state = self.state.lock().unwrap();
        state.page_fetches += 1;
        let page = state.pages.pop_front().unwrap_or_default();
        Box::pin(async move { Ok(page) })
    }

    fn has_next(&self) -> bool {
        !self.state.lock().unwrap().pages.is_empty()
    }
}

struct ScriptedFeed {
    state: Arc<Mutex<SourceState>>,
}

impl FeedClient for ScriptedFeed {
    fn next_batch(&mut self) -> BoxFuture<'_, FeedBatch> {
        let mut state = self.state.lock().unwrap();
        state.feed_fetches += 1;
        let committed = state.committed;
        let batch = state.feed.pop_front().unwrap_or_else(|| {
            Ok(FeedBatch::new(
                Vec::new(),
                ResumeToken::new(format!("idle-{committed}")),
                committed,
            ))
        });
        Box::pin(async move { batch })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

impl SourceClient for ScriptedSource {
    fn open_scan(&self, request: ScanRequest) -> BoxFuture<'_, Box<dyn ScanClient>> {
        self.state.lock().unwrap().scan_requests.push(request);
        let client: Box<dyn ScanClient> = Box::new(ScriptedScan {
            state: Arc::clone(&self.state),
        });
        Box::pin(async move { Ok(client) })
    }

    fn open_feed(&self, request: FeedRequest) -> BoxFuture<'_, Box<dyn FeedClient>> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.feed_requests.push(request);
            state.hang_open_feed
        };
        if hang {
            return Box::pin(futures::future::pending());
        }
        let client: Box<dyn FeedClient> = Box::new(ScriptedFeed {
            state: Arc::clone(&self.state),
        });
        Box::pin(async move { Ok(client) })
    }

    fn current_committed_time(&self) -> BoxFuture<'_, Timestamp> {
        let committed = self.state.lock().unwrap().committed;
        Box::pin(async move { Ok(committed) })
    }

    fn resolve_collection_name<'a>(
        &'a self,
        definition: &'a IndexDefinition,
    ) -> BoxFuture<'a, String> {
        let name = self.state.lock().unwrap().collection.clone();
        Box::pin(async move {
            name.ok_or_else(|| SyncError::dropped(format!("{} not found", definition.namespace())))
        })
    }

    fn sync_source_host(&self) -> Option<String> {
        self.state.lock().unwrap().host.clone()
    }

    fn collection_stats<'a>(
        &'a self,
        _namespace: &'a Namespace,
    ) -> BoxFuture<'a, Option<CollectionStats>> {
        let stats = {
            let mut state = self.state.lock().unwrap();
            state.stats_requests += 1;
            state.stats
        };
        Box::pin(async move { Ok(stats) })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct ScheduledBatch {
    pub attempt: AttemptId,
    pub events: Vec<DocumentEvent>,
    pub priority: Priority,
    pub metadata: Option<CommitMetadata>,
}

/// Scheduler that completes every batch immediately and records it.
#[derive(Default)]
pub(crate) struct RecordingScheduler {
    pub batches: Mutex<Vec<ScheduledBatch>>,
    pub cancels: Mutex<Vec<SyncError>>,
}

impl RecordingScheduler {
    pub fn batches(&self) -> Vec<ScheduledBatch> {
        self.batches.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<DocumentEvent> {
        self.batches().into_iter().flat_map(|b| b.events).collect()
    }
}

impl IndexingScheduler for RecordingScheduler {
    fn schedule(
        &self,
        _generation: &GenerationId,
        attempt: AttemptId,
        events: Vec<DocumentEvent>,
        priority: Priority,
        metadata: Option<CommitMetadata>,
    ) -> BatchFuture {
        self.batches.lock().unwrap().push(ScheduledBatch {
            attempt,
            events,
            priority,
            metadata,
        });
        ready_batch()
    }

    fn cancel<'a>(
        &'a self,
        _generation: &'a GenerationId,
        _attempt: AttemptId,
        reason: SyncError,
    ) -> BoxFuture<'a, ()> {
        self.cancels.lock().unwrap().push(reason);
        Box::pin(async { Ok(()) })
    }
}
