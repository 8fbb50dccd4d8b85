//! In-memory source database with a replayable change feed.
//!
//! Feed tokens are the zero-padded position of an event in the log, so a
//! cursor reopened after any token continues exactly where it left off, and
//! a cursor opened at an operation time starts at the first event at or
//! after it.

use super::ns;
use index_replication::error::{Result, SyncError};
use index_replication::feed::{FeedBatch, FeedEvent, UpdateDescription};
use index_replication::interfaces::{
    BoxFuture, FeedClient, FeedRequest, FeedStart, ScanClient, ScanPage, ScanRequest,
    SourceClient,
};
use index_replication::model::{
    document_key, Document, DocumentKey, IndexDefinition, Namespace, ScanPosition, Timestamp,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Token of the event at `index`.
pub fn token_for(index: usize) -> String {
    format!("{index:08}")
}

const BEGIN: &str = "begin";

pub struct Oplog {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub events: Vec<FeedEvent>,
    pub page_size: usize,
    pub batch_size: usize,
    pub committed: Timestamp,
    /// `None` once the collection is dropped.
    pub collection: Option<String>,
    pub scan_requests: Vec<ScanRequest>,
    pub feed_requests: Vec<FeedRequest>,
    pub page_fetches: usize,
    pub feed_fetches: usize,
}

/// Shared handle on an [`Oplog`].
#[derive(Clone)]
pub struct OplogSource {
    pub log: Arc<Mutex<Oplog>>,
}

impl OplogSource {
    pub fn new(committed: Timestamp) -> Self {
        Self {
            log: Arc::new(Mutex::new(Oplog {
                documents: BTreeMap::new(),
                events: Vec::new(),
                page_size: 2,
                batch_size: 2,
                committed,
                collection: Some(ns().collection),
                scan_requests: Vec::new(),
                feed_requests: Vec::new(),
                page_fetches: 0,
                feed_fetches: 0,
            })),
        }
    }

    /// Seed the collection snapshot the scan reads.
    pub fn with_documents(self, documents: impl IntoIterator<Item = Document>) -> Self {
        {
            let mut log = self.log.lock().unwrap();
            for doc in documents {
                let key = document_key(&doc).unwrap_or(DocumentKey::Str(String::new()));
                log.documents.insert(key, doc);
            }
        }
        self
    }

    /// Keep a document without a usable key in the snapshot.
    pub fn with_keyless(self, key: &str, doc: Document) -> Self {
        self.log
            .lock()
            .unwrap()
            .documents
            .insert(DocumentKey::Str(format!("~keyless-{key}")), doc);
        self
    }

    pub fn with_page_size(self, page_size: usize) -> Self {
        self.log.lock().unwrap().page_size = page_size;
        self
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        self.log.lock().unwrap().batch_size = batch_size;
        self
    }

    /// Append an event one second after the committed time and advance it.
    pub fn push(&self, build: impl FnOnce(&str, Timestamp, &Namespace) -> FeedEvent) -> String {
        let mut log = self.log.lock().unwrap();
        let token = token_for(log.events.len());
        let time = Timestamp::new(log.committed.seconds + 1, 0);
        let event = build(&token, time, &ns());
        log.events.push(event);
        log.committed = time;
        token
    }

    pub fn insert(&self, doc: Document) -> String {
        self.push(|token, time, ns| FeedEvent::insert(token, time, ns, doc))
    }

    pub fn update(&self, key: i64, field: &str) -> String {
        let mut update = UpdateDescription::default();
        update
            .updated_fields
            .insert(field.to_string(), serde_json::json!(key));
        self.push(|token, time, ns| FeedEvent::update(token, time, ns, DocumentKey::Int(key), update))
    }

    pub fn delete(&self, key: i64) -> String {
        self.push(|token, time, ns| FeedEvent::delete(token, time, ns, DocumentKey::Int(key)))
    }

    pub fn committed(&self) -> Timestamp {
        self.log.lock().unwrap().committed
    }

    pub fn page_fetches(&self) -> usize {
        self.log.lock().unwrap().page_fetches
    }

    pub fn feed_fetches(&self) -> usize {
        self.log.lock().unwrap().feed_fetches
    }

    pub fn feed_requests(&self) -> Vec<FeedRequest> {
        self.log.lock().unwrap().feed_requests.clone()
    }

    pub fn scan_requests(&self) -> Vec<ScanRequest> {
        self.log.lock().unwrap().scan_requests.clone()
    }
}

struct OplogScan {
    remaining: Vec<Document>,
    page_size: usize,
    log: Arc<Mutex<Oplog>>,
}

impl ScanClient for OplogScan {
    fn next_page(&mut self) -> BoxFuture<'_, ScanPage> {
        self.log.lock().unwrap().page_fetches += 1;
        let take = self.page_size.min(self.remaining.len());
        let documents: Vec<Document> = self.remaining.drain(..take).collect();
        Box::pin(async move {
            Ok(ScanPage {
                documents,
                post_batch_token: None,
            })
        })
    }

    fn has_next(&self) -> bool {
        !self.remaining.is_empty()
    }
}

struct OplogFeed {
    position: usize,
    log: Arc<Mutex<Oplog>>,
}

impl FeedClient for OplogFeed {
    fn next_batch(&mut self) -> BoxFuture<'_, FeedBatch> {
        let mut log = self.log.lock().unwrap();
        log.feed_fetches += 1;
        let end = (self.position + log.batch_size).min(log.events.len());
        let events: Vec<FeedEvent> = log.events[self.position..end].to_vec();
        self.position = end;

        let token = match end {
            0 => BEGIN.to_string(),
            n => token_for(n - 1),
        };
        let operation_time = events.last().map_or(log.committed, |e| e.cluster_time);
        let batch = FeedBatch::from_events(&events, &token, operation_time);
        Box::pin(async move { Ok(batch) })
    }

    fn close(&mut self) -> BoxFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}

fn start_index(log: &Oplog, start: &FeedStart) -> Result<usize> {
    match start {
        FeedStart::AtOperationTime(time) => Ok(log
            .events
            .iter()
            .position(|e| e.cluster_time >= *time)
            .unwrap_or(log.events.len())),
        FeedStart::AfterToken(token) if token.as_str() == BEGIN => Ok(0),
        FeedStart::AfterToken(token) => token
            .as_str()
            .parse::<usize>()
            .map(|i| i + 1)
            .map_err(|_| SyncError::requires_resync(format!("unknown resume token {token}"))),
    }
}

impl SourceClient for OplogSource {
    fn open_scan(&self, request: ScanRequest) -> BoxFuture<'_, Box<dyn ScanClient>> {
        let mut log = self.log.lock().unwrap();
        let remaining: Vec<Document> = match &request.position {
            ScanPosition::Key(Some(after)) => log
                .documents
                .range((std::ops::Bound::Excluded(after.clone()), std::ops::Bound::Unbounded))
                .map(|(_, d)| d.clone())
                .collect(),
            _ => log.documents.values().cloned().collect(),
        };
        let page_size = log.page_size;
        log.scan_requests.push(request);
        let client: Box<dyn ScanClient> = Box::new(OplogScan {
            remaining,
            page_size,
            log: Arc::clone(&self.log),
        });
        Box::pin(async move { Ok(client) })
    }

    fn open_feed(&self, request: FeedRequest) -> BoxFuture<'_, Box<dyn FeedClient>> {
        let mut log = self.log.lock().unwrap();
        let position = start_index(&log, &request.start);
        log.feed_requests.push(request);
        let log_handle = Arc::clone(&self.log);
        Box::pin(async move {
            let client: Box<dyn FeedClient> = Box::new(OplogFeed {
                position: position?,
                log: log_handle,
            });
            Ok(client)
        })
    }

    fn current_committed_time(&self) -> BoxFuture<'_, Timestamp> {
        let committed = self.log.lock().unwrap().committed;
        Box::pin(async move { Ok(committed) })
    }

    fn resolve_collection_name<'a>(
        &'a self,
        definition: &'a IndexDefinition,
    ) -> BoxFuture<'a, String> {
        let name = self.log.lock().unwrap().collection.clone();
        Box::pin(async move {
            name.ok_or_else(|| SyncError::dropped(format!("{} not found", definition.namespace())))
        })
    }
}
