//! Document mutation events and batch preprocessing.
//!
//! Scan pages and feed records are both turned into [`DocumentEvent`]s
//! before they reach the indexer.
//!
//! # Design
//!
//! ```text
//! scan page ──────▶ from_scan_page ───┐
//!                   (skip key-less)   │
//!                                     ├──▶ DocumentEventBatch ──▶ Indexer
//! feed records ───▶ from_feed_events ─┘    witnessed / applicable /
//!                   (drop no-op updates)   skipped counters
//! ```
//!
//! Preprocessing never reorders events. Updates that touch no indexed path
//! are dropped; they are still counted as witnessed.

use crate::error::{Result, SyncError};
use crate::feed::{FeedEvent, OperationType, UpdateDescription};
use crate::model::{document_key, Document, DocumentKey, IndexMapping};
use std::collections::BTreeMap;

/// Embedding vectors keyed by field path, reusable as-is by the indexer.
pub type ReusedVectors = BTreeMap<String, Vec<f32>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentEventKind {
    Insert,
    Update,
    Replace,
    Delete,
}

/// One document mutation, consumed exactly once by indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentEvent {
    pub kind: DocumentEventKind,
    pub key: DocumentKey,
    pub document: Option<Document>,
    pub update: Option<UpdateDescription>,
    pub reused_vectors: Option<ReusedVectors>,
}

impl DocumentEvent {
    pub fn insert(key: DocumentKey, document: Document) -> Self {
        Self {
            kind: DocumentEventKind::Insert,
            key,
            document: Some(document),
            update: None,
            reused_vectors: None,
        }
    }

    /// Update carrying the new document and any still-valid vectors.
    pub fn update(key: DocumentKey, document: Document, reused_vectors: ReusedVectors) -> Self {
        Self {
            kind: DocumentEventKind::Update,
            key,
            document: Some(document),
            update: None,
            reused_vectors: (!reused_vectors.is_empty()).then_some(reused_vectors),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            kind: DocumentEventKind::Delete,
            key,
            document: None,
            update: None,
            reused_vectors: None,
        }
    }
}

/// Events of one scan page or feed batch, plus preprocessing counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentEventBatch {
    pub events: Vec<DocumentEvent>,
    /// Records seen, before filtering.
    pub witnessed: usize,
    /// Records that produced an event.
    pub applicable: usize,
    /// Records skipped because their key was missing or unusable.
    pub skipped_keyless: usize,
}

impl DocumentEventBatch {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Build Insert events for a scan page, skipping key-less documents.
    pub fn from_scan_page(docs: Vec<Document>) -> Self {
        let mut batch = Self {
            witnessed: docs.len(),
            ..Self::default()
        };
        for doc in docs {
            match document_key(&doc) {
                Some(key) => batch.events.push(DocumentEvent::insert(key, doc)),
                None => batch.skipped_keyless += 1,
            }
        }
        batch.applicable = batch.events.len();
        batch
    }

    /// Convert decoded feed records into document events.
    ///
    /// Every record must be a document mutation. A drop that slipped into
    /// the mutation prefix means the collection is gone; any other
    /// non-mutation record requires a resync.
    pub fn from_feed_events<'a, I>(events: I, mapping: &IndexMapping) -> Result<Self>
    where
        I: IntoIterator<Item = &'a FeedEvent>,
    {
        let mut batch = Self::default();
        for event in events {
            batch.witnessed += 1;
            match feed_event_to_document_event(event, mapping)? {
                Converted::Event(e) => batch.events.push(e),
                Converted::Irrelevant => {}
                Converted::Keyless => batch.skipped_keyless += 1,
            }
        }
        batch.applicable = batch.events.len();
        Ok(batch)
    }
}

enum Converted {
    Event(DocumentEvent),
    Irrelevant,
    Keyless,
}

fn feed_event_to_document_event(event: &FeedEvent, mapping: &IndexMapping) -> Result<Converted> {
    let kind = match &event.op {
        OperationType::Insert => DocumentEventKind::Insert,
        OperationType::Update => DocumentEventKind::Update,
        OperationType::Replace => DocumentEventKind::Replace,
        OperationType::Delete => DocumentEventKind::Delete,
        OperationType::Drop | OperationType::DropDatabase => {
            return Err(SyncError::dropped(format!(
                "{} event among document mutations",
                event.op
            )))
        }
        other => {
            return Err(SyncError::requires_resync(format!(
                "unexpected '{other}' event among document mutations"
            )))
        }
    };

    if kind == DocumentEventKind::Update {
        if let Some(update) = &event.update {
            if !update.paths().any(|p| mapping.covers(p)) {
                return Ok(Converted::Irrelevant);
            }
        }
    }

    let Some(key) = event.key() else {
        return Ok(Converted::Keyless);
    };

    Ok(Converted::Event(DocumentEvent {
        kind,
        key,
        document: event.full_document.clone(),
        update: event.update.clone(),
        reused_vectors: None,
    }))
}
