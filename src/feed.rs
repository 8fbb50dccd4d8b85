// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change-feed records and batch classification.
//!
//! A feed batch arrives as raw, undecoded records. Decoding is the expensive
//! part, so everything that only needs to look at the *shape* of a batch
//! (lifecycle detection, resume-position selection) works through a
//! [`LazyDecodeView`] that decodes a record the first time it is pulled.
//!
//! # Lifecycle Events
//!
//! Invalidating operations (rename, drop, drop-database, invalidate) are
//! always the final one or two records of a batch. Two classifiers exist:
//!
//! - [`classify_batch`] walks the whole batch. Used when decoding happens
//!   inline on the dispatcher.
//! - [`classify_batch_tail`] looks only at the last two records (or the first
//!   one when a rename from the previous batch is awaiting its invalidate).
//!   Used when decoding is offloaded, so the dispatcher never decodes the
//!   bulk of the batch itself.
//!
//! Rename is two-step: the RENAME record only marks a pending destination;
//! the record after it must be INVALIDATE, whose token becomes the resume
//! point on the new namespace. Anything else after a rename is a protocol
//! violation.
//!
//! # Resume Selection
//!
//! [`select_resume_info`] never returns the position of an invalidating
//! record: resuming there would replay straight into the boundary.

use crate::error::{Result, SyncError};
use crate::model::{
    Document, DocumentKey, FeedResumeInfo, Namespace, ResumeInfo, ResumeToken, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::cell::OnceCell;
use std::fmt;

/// Records larger than this cannot be indexed without truncation.
pub const MAX_RECORD_BYTES: usize = 16 * 1024 * 1024 + 16 * 1024;

// ═══════════════════════════════════════════════════════════════════════════════
// Operation types
// ═══════════════════════════════════════════════════════════════════════════════

/// Feed operation type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    DropDatabase,
    Rename,
    Invalidate,
    /// Anything the engine does not understand (DDL, future event types).
    Other(String),
}

impl OperationType {
    pub fn as_str(&self) -> &str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Rename => "rename",
            OperationType::Invalidate => "invalidate",
            OperationType::Other(op) => op,
        }
    }

    /// Rename, drop, drop-database and invalidate end a cursor's life.
    pub fn is_invalidating(&self) -> bool {
        matches!(
            self,
            OperationType::Rename
                | OperationType::Drop
                | OperationType::DropDatabase
                | OperationType::Invalidate
        )
    }

    pub fn is_document_mutation(&self) -> bool {
        matches!(
            self,
            OperationType::Insert
                | OperationType::Update
                | OperationType::Replace
                | OperationType::Delete
        )
    }
}

impl From<String> for OperationType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "insert" => OperationType::Insert,
            "update" => OperationType::Update,
            "replace" => OperationType::Replace,
            "delete" => OperationType::Delete,
            "drop" => OperationType::Drop,
            "dropDatabase" => OperationType::DropDatabase,
            "rename" => OperationType::Rename,
            "invalidate" => OperationType::Invalidate,
            _ => OperationType::Other(s),
        }
    }
}

impl From<OperationType> for String {
    fn from(op: OperationType) -> Self {
        op.as_str().to_string()
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Records
// ═══════════════════════════════════════════════════════════════════════════════

/// Field-level description of an update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateDescription {
    #[serde(default)]
    pub updated_fields: Document,
    #[serde(default)]
    pub removed_fields: Vec<String>,
    #[serde(default)]
    pub truncated_arrays: Vec<String>,
}

impl UpdateDescription {
    /// Every dotted path the update touched.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.updated_fields
            .keys()
            .map(String::as_str)
            .chain(self.removed_fields.iter().map(String::as_str))
            .chain(self.truncated_arrays.iter().map(String::as_str))
    }
}

/// A decoded change-feed record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub op: OperationType,
    pub token: ResumeToken,
    pub cluster_time: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ns: Option<Namespace>,
    /// Rename destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<Namespace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_document: Option<Document>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateDescription>,
}

impl FeedEvent {
    fn bare(op: OperationType, token: &str, cluster_time: Timestamp, ns: &Namespace) -> Self {
        Self {
            op,
            token: ResumeToken::new(token),
            cluster_time,
            ns: Some(ns.clone()),
            to: None,
            document_key: None,
            full_document: None,
            update: None,
        }
    }

    pub fn insert(token: &str, cluster_time: Timestamp, ns: &Namespace, doc: Document) -> Self {
        let key = doc.get(crate::model::KEY_FIELD).cloned();
        Self {
            document_key: key,
            full_document: Some(doc),
            ..Self::bare(OperationType::Insert, token, cluster_time, ns)
        }
    }

    pub fn update(
        token: &str,
        cluster_time: Timestamp,
        ns: &Namespace,
        key: DocumentKey,
        update: UpdateDescription,
    ) -> Self {
        Self {
            document_key: Some(key.to_value()),
            update: Some(update),
            ..Self::bare(OperationType::Update, token, cluster_time, ns)
        }
    }

    pub fn delete(token: &str, cluster_time: Timestamp, ns: &Namespace, key: DocumentKey) -> Self {
        Self {
            document_key: Some(key.to_value()),
            ..Self::bare(OperationType::Delete, token, cluster_time, ns)
        }
    }

    pub fn drop_collection(token: &str, cluster_time: Timestamp, ns: &Namespace) -> Self {
        Self::bare(OperationType::Drop, token, cluster_time, ns)
    }

    pub fn rename(
        token: &str,
        cluster_time: Timestamp,
        ns: &Namespace,
        to: Option<Namespace>,
    ) -> Self {
        Self {
            to,
            ..Self::bare(OperationType::Rename, token, cluster_time, ns)
        }
    }

    pub fn invalidate(token: &str, cluster_time: Timestamp, ns: &Namespace) -> Self {
        Self::bare(OperationType::Invalidate, token, cluster_time, ns)
    }

    pub fn other(op: &str, token: &str, cluster_time: Timestamp, ns: &Namespace) -> Self {
        Self::bare(OperationType::Other(op.to_string()), token, cluster_time, ns)
    }

    pub fn key(&self) -> Option<DocumentKey> {
        self.document_key.as_ref().and_then(DocumentKey::from_value)
    }

    pub fn encode(&self) -> RawFeedEvent {
        // Serializing plain data to a Vec cannot fail.
        RawFeedEvent::new(serde_json::to_vec(self).unwrap_or_default())
    }
}

/// An undecoded change-feed record as fetched from the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFeedEvent {
    bytes: Vec<u8>,
}

impl RawFeedEvent {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Decode the record.
    ///
    /// Oversized records require a resync that keeps the current index;
    /// malformed records require a full resync.
    pub fn decode(&self) -> Result<FeedEvent> {
        if self.bytes.len() > MAX_RECORD_BYTES {
            return Err(SyncError::NonInvalidatingResync(format!(
                "feed record of {} bytes exceeds the {} byte limit",
                self.bytes.len(),
                MAX_RECORD_BYTES
            )));
        }
        serde_json::from_slice(&self.bytes)
            .map_err(|e| SyncError::requires_resync(format!("malformed feed record: {e}")))
    }
}

/// One fetch from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedBatch {
    pub events: Vec<RawFeedEvent>,
    /// Position after the last record (or after an empty wait).
    pub post_batch_token: ResumeToken,
    /// Source operation time when the batch was produced.
    pub operation_time: Timestamp,
}

impl FeedBatch {
    pub fn new(
        events: Vec<RawFeedEvent>,
        post_batch_token: ResumeToken,
        operation_time: Timestamp,
    ) -> Self {
        Self {
            events,
            post_batch_token,
            operation_time,
        }
    }

    pub fn from_events(
        events: &[FeedEvent],
        post_batch_token: &str,
        operation_time: Timestamp,
    ) -> Self {
        Self::new(
            events.iter().map(FeedEvent::encode).collect(),
            ResumeToken::new(post_batch_token),
            operation_time,
        )
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.events.iter().map(RawFeedEvent::len).sum()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lazy decode view
// ═══════════════════════════════════════════════════════════════════════════════

/// Decode-on-pull view over a slice of raw records.
///
/// Each record is decoded at most once; decoded records are cached for the
/// lifetime of the view.
pub struct LazyDecodeView<'a> {
    raw: &'a [RawFeedEvent],
    decoded: Vec<OnceCell<FeedEvent>>,
}

impl<'a> LazyDecodeView<'a> {
    pub fn new(raw: &'a [RawFeedEvent]) -> Self {
        Self {
            raw,
            decoded: (0..raw.len()).map(|_| OnceCell::new()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&FeedEvent> {
        let cell = self.decoded.get(index).ok_or_else(|| {
            SyncError::transient(format!(
                "feed view index {index} out of bounds ({})",
                self.raw.len()
            ))
        })?;
        if let Some(event) = cell.get() {
            return Ok(event);
        }
        let event = self.raw[index].decode()?;
        Ok(cell.get_or_init(|| event))
    }

    /// Number of records decoded so far.
    pub fn decoded_count(&self) -> usize {
        self.decoded.iter().filter(|c| c.get().is_some()).count()
    }

    /// Pull every record in order, decoding as needed.
    pub fn iter(&self) -> impl Iterator<Item = Result<&FeedEvent>> + '_ {
        (0..self.len()).map(move |i| self.get(i))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Lifecycle classification
// ═══════════════════════════════════════════════════════════════════════════════

/// A feed condition that cannot be expressed as a document mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    Dropped { reason: String },
    Renamed(FeedResumeInfo),
    Invalidated(ResumeInfo),
    UnrecognizedOperation { operation: String },
    /// A rename was not followed by the invalidate that confirms it.
    UnconfirmedRename { next: String },
    /// A rename whose destination the source did not report.
    RenameWithoutDestination,
    /// The collection was found under a new name when (re)starting.
    NamespaceChanged { from: Namespace, to: Namespace },
}

impl LifecycleEvent {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleEvent::Dropped { .. } => "dropped",
            LifecycleEvent::Renamed(_) => "renamed",
            LifecycleEvent::Invalidated(_) => "invalidated",
            LifecycleEvent::UnrecognizedOperation { .. } => "unrecognized_operation",
            LifecycleEvent::UnconfirmedRename { .. } => "unconfirmed_rename",
            LifecycleEvent::RenameWithoutDestination => "rename_without_destination",
            LifecycleEvent::NamespaceChanged { .. } => "namespace_changed",
        }
    }

    /// The error that ends the generation, if this event ends it.
    pub fn into_error(self) -> Option<SyncError> {
        match self {
            LifecycleEvent::Dropped { reason } => Some(SyncError::Dropped(reason)),
            LifecycleEvent::Renamed(info) => Some(SyncError::Renamed(info)),
            LifecycleEvent::Invalidated(info) => Some(SyncError::Invalidated(info)),
            LifecycleEvent::UnrecognizedOperation { operation } => Some(
                SyncError::requires_resync(format!("unrecognized feed operation '{operation}'")),
            ),
            LifecycleEvent::UnconfirmedRename { next } => Some(SyncError::requires_resync(
                format!("rename followed by '{next}' instead of invalidate"),
            )),
            LifecycleEvent::RenameWithoutDestination => Some(SyncError::NonInvalidatingResync(
                "rename event without a destination namespace".to_string(),
            )),
            LifecycleEvent::NamespaceChanged { .. } => None,
        }
    }
}

/// Outcome of looking for lifecycle events in one batch.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchClassification {
    /// Records `[0, mutation_count)` are to be decoded and indexed.
    pub mutation_count: usize,
    pub lifecycle: Option<LifecycleEvent>,
    /// Rename destination still waiting for its invalidate.
    pub pending_rename: Option<Namespace>,
}

impl BatchClassification {
    /// Whether the batch contains anything besides document mutations.
    pub fn has_lifecycle(&self) -> bool {
        self.lifecycle.is_some() || self.pending_rename.is_some()
    }
}

/// Classify a RENAME record relative to our namespace.
///
/// `Ok(dest)` means a rename of our collection that now awaits its invalidate.
fn classify_rename(
    event: &FeedEvent,
    ours: &Namespace,
) -> std::result::Result<Namespace, LifecycleEvent> {
    let Some(dest) = event.to.clone() else {
        return Err(LifecycleEvent::RenameWithoutDestination);
    };
    match &event.ns {
        Some(source) if source != ours && &dest == ours => Err(LifecycleEvent::Dropped {
            reason: format!("collection overwritten by {source}"),
        }),
        _ => Ok(dest),
    }
}

/// Walk `view[start..]` looking for the first lifecycle condition.
fn classify_from(
    view: &LazyDecodeView<'_>,
    start: usize,
    ours: &Namespace,
    pending_rename: Option<Namespace>,
) -> Result<BatchClassification> {
    let mut pending = pending_rename;
    let mut mutation_count = start;

    for index in start..view.len() {
        let event = view.get(index)?;

        if let Some(dest) = pending.take() {
            let lifecycle = match event.op {
                OperationType::Invalidate => LifecycleEvent::Renamed(FeedResumeInfo {
                    namespace: dest,
                    resume_token: event.token.clone(),
                    operation_time: event.cluster_time,
                }),
                ref op => LifecycleEvent::UnconfirmedRename {
                    next: op.to_string(),
                },
            };
            return Ok(BatchClassification {
                mutation_count,
                lifecycle: Some(lifecycle),
                pending_rename: None,
            });
        }

        let lifecycle = match &event.op {
            op if op.is_document_mutation() => {
                mutation_count = index + 1;
                continue;
            }
            OperationType::Drop | OperationType::DropDatabase => LifecycleEvent::Dropped {
                reason: format!("{} event for {ours}", event.op),
            },
            OperationType::Rename => match classify_rename(event, ours) {
                Ok(dest) => {
                    pending = Some(dest);
                    continue;
                }
                Err(lifecycle) => lifecycle,
            },
            OperationType::Invalidate => LifecycleEvent::Invalidated(ResumeInfo::ChangeFeed(
                FeedResumeInfo {
                    namespace: ours.clone(),
                    resume_token: event.token.clone(),
                    operation_time: event.cluster_time,
                },
            )),
            other => LifecycleEvent::UnrecognizedOperation {
                operation: other.to_string(),
            },
        };

        return Ok(BatchClassification {
            mutation_count: index,
            lifecycle: Some(lifecycle),
            pending_rename: None,
        });
    }

    Ok(BatchClassification {
        mutation_count,
        lifecycle: None,
        pending_rename: pending,
    })
}

/// Classify a batch by walking every record.
pub fn classify_batch(
    view: &LazyDecodeView<'_>,
    ours: &Namespace,
    pending_rename: Option<Namespace>,
) -> Result<BatchClassification> {
    classify_from(view, 0, ours, pending_rename)
}

/// Classify a batch by inspecting only its tail.
///
/// Decodes at most the last two records, or only the first record when a
/// rename from the previous batch is pending. Records before the returned
/// `mutation_count` are not inspected and must be validated by the decoder.
pub fn classify_batch_tail(
    view: &LazyDecodeView<'_>,
    ours: &Namespace,
    pending_rename: Option<Namespace>,
) -> Result<BatchClassification> {
    if pending_rename.is_some() {
        // Only the first record can confirm the rename.
        return classify_from(view, 0, ours, pending_rename);
    }

    let len = view.len();
    let mut start = len;
    for index in len.saturating_sub(2)..len {
        if view.get(index)?.op.is_invalidating() {
            start = index;
            break;
        }
    }
    if start == len {
        return Ok(BatchClassification {
            mutation_count: len,
            lifecycle: None,
            pending_rename: None,
        });
    }
    classify_from(view, start, ours, None)
}

/// Pick the resume position to publish after a batch is indexed.
///
/// - empty batch, or last record not invalidating: the post-batch token
/// - otherwise: the last non-invalidating record's token
/// - every record invalidating: `None` (keep the previous position)
pub fn select_resume_info(
    batch: &FeedBatch,
    view: &LazyDecodeView<'_>,
    ours: &Namespace,
) -> Result<Option<FeedResumeInfo>> {
    let post_batch = || FeedResumeInfo {
        namespace: ours.clone(),
        resume_token: batch.post_batch_token.clone(),
        operation_time: batch.operation_time,
    };

    if view.is_empty() {
        return Ok(Some(post_batch()));
    }
    if !view.get(view.len() - 1)?.op.is_invalidating() {
        return Ok(Some(post_batch()));
    }
    for index in (0..view.len()).rev() {
        let event = view.get(index)?;
        if !event.op.is_invalidating() {
            return Ok(Some(FeedResumeInfo {
                namespace: ours.clone(),
                resume_token: event.token.clone(),
                operation_time: event.cluster_time,
            }));
        }
    }
    Ok(None)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns() -> Namespace {
        Namespace::new("db", "coll")
    }

    fn doc(v: serde_json::Value) -> Document {
        v.as_object().cloned().unwrap_or_default()
    }

    fn ts(s: u32) -> Timestamp {
        Timestamp::new(s, 0)
    }

    fn raw(events: &[FeedEvent]) -> Vec<RawFeedEvent> {
        events.iter().map(FeedEvent::encode).collect()
    }

    fn touch(field: &str) -> UpdateDescription {
        let mut update = UpdateDescription::default();
        update.updated_fields.insert(field.to_string(), json!(1));
        update
    }

    #[test]
    fn test_operation_type_from_str() {
        assert_eq!(OperationType::from("insert".to_string()), OperationType::Insert);
        assert_eq!(
            OperationType::from("dropDatabase".to_string()),
            OperationType::DropDatabase
        );
        assert_eq!(
            OperationType::from("createIndexes".to_string()),
            OperationType::Other("createIndexes".to_string())
        );
    }

    #[test]
    fn test_invalidating_set() {
        assert!(OperationType::Rename.is_invalidating());
        assert!(OperationType::Drop.is_invalidating());
        assert!(OperationType::DropDatabase.is_invalidating());
        assert!(OperationType::Invalidate.is_invalidating());
        assert!(!OperationType::Update.is_invalidating());
        assert!(!OperationType::Other("modify".into()).is_invalidating());
    }

    #[test]
    fn test_decode_malformed_requires_resync() {
        let err = RawFeedEvent::new(b"{not json".to_vec()).decode().unwrap_err();
        assert!(matches!(err, SyncError::RequiresResync(_)));
    }

    #[test]
    fn test_decode_oversized_is_non_invalidating() {
        let err = RawFeedEvent::new(vec![b' '; MAX_RECORD_BYTES + 1])
            .decode()
            .unwrap_err();
        assert!(matches!(err, SyncError::NonInvalidatingResync(_)));
    }

    #[test]
    fn test_decode_roundtrip_preserves_event() {
        let event = FeedEvent::insert("t1", ts(1), &ns(), doc(json!({"_id": 1, "v": "a"})));
        assert_eq!(event.encode().decode().unwrap(), event);
        assert_eq!(event.key(), Some(DocumentKey::Int(1)));
    }

    #[test]
    fn test_lazy_view_decodes_on_pull() {
        let records = raw(&[
            FeedEvent::delete("t1", ts(1), &ns(), DocumentKey::Int(1)),
            FeedEvent::delete("t2", ts(2), &ns(), DocumentKey::Int(2)),
            FeedEvent::delete("t3", ts(3), &ns(), DocumentKey::Int(3)),
        ]);
        let view = LazyDecodeView::new(&records);
        assert_eq!(view.decoded_count(), 0);
        assert_eq!(view.get(2).unwrap().token.as_str(), "t3");
        assert_eq!(view.decoded_count(), 1);
        assert_eq!(view.get(2).unwrap().token.as_str(), "t3");
        assert_eq!(view.decoded_count(), 1);
        assert!(view.get(3).is_err());
    }

    #[test]
    fn test_classify_plain_batch() {
        let records = raw(&[
            FeedEvent::update("t1", ts(1), &ns(), DocumentKey::Int(1), touch("a")),
            FeedEvent::delete("t2", ts(2), &ns(), DocumentKey::Int(2)),
        ]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch(&view, &ns(), None).unwrap();
        assert_eq!(c.mutation_count, 2);
        assert!(!c.has_lifecycle());
    }

    #[test]
    fn test_classify_drop() {
        let records = raw(&[
            FeedEvent::delete("t1", ts(1), &ns(), DocumentKey::Int(1)),
            FeedEvent::drop_collection("t2", ts(2), &ns()),
            FeedEvent::invalidate("t3", ts(2), &ns()),
        ]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch(&view, &ns(), None).unwrap();
        assert_eq!(c.mutation_count, 1);
        assert!(matches!(c.lifecycle, Some(LifecycleEvent::Dropped { .. })));
    }

    #[test]
    fn test_classify_rename_then_invalidate() {
        let dest = Namespace::new("db", "b");
        let records = raw(&[
            FeedEvent::rename("t1", ts(5), &ns(), Some(dest.clone())),
            FeedEvent::invalidate("t2", ts(5), &ns()),
        ]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch(&view, &ns(), None).unwrap();
        match c.lifecycle {
            Some(LifecycleEvent::Renamed(info)) => {
                assert_eq!(info.namespace, dest);
                assert_eq!(info.resume_token.as_str(), "t2");
            }
            other => panic!("expected rename, got {other:?}"),
        }
        assert_eq!(c.mutation_count, 0);
    }

    #[test]
    fn test_classify_rename_then_update_requires_resync() {
        let records = raw(&[
            FeedEvent::rename("t1", ts(5), &ns(), Some(Namespace::new("db", "b"))),
            FeedEvent::update("t2", ts(6), &ns(), DocumentKey::Int(1), touch("a")),
        ]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch(&view, &ns(), None).unwrap();
        let err = c.lifecycle.and_then(LifecycleEvent::into_error).unwrap();
        assert!(matches!(err, SyncError::RequiresResync(_)));
    }

    #[test]
    fn test_classify_rename_split_across_batches() {
        let dest = Namespace::new("db", "b");
        let first = raw(&[
            FeedEvent::delete("t0", ts(4), &ns(), DocumentKey::Int(1)),
            FeedEvent::rename("t1", ts(5), &ns(), Some(dest.clone())),
        ]);
        let view = LazyDecodeView::new(&first);
        let c = classify_batch(&view, &ns(), None).unwrap();
        assert_eq!(c.mutation_count, 1);
        assert_eq!(c.pending_rename, Some(dest.clone()));
        assert!(c.lifecycle.is_none());

        let second = raw(&[FeedEvent::invalidate("t2", ts(5), &ns())]);
        let view = LazyDecodeView::new(&second);
        let c = classify_batch(&view, &ns(), Some(dest.clone())).unwrap();
        assert!(matches!(
            c.lifecycle,
            Some(LifecycleEvent::Renamed(ref info)) if info.namespace == dest
        ));
    }

    #[test]
    fn test_classify_rename_without_destination() {
        let records = raw(&[FeedEvent::rename("t1", ts(5), &ns(), None)]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch(&view, &ns(), None).unwrap();
        let err = c.lifecycle.and_then(LifecycleEvent::into_error).unwrap();
        assert!(matches!(err, SyncError::NonInvalidatingResync(_)));
    }

    #[test]
    fn test_classify_rename_overwrote_our_collection() {
        let other = Namespace::new("db", "staging");
        let records = raw(&[FeedEvent::rename("t1", ts(5), &other, Some(ns()))]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch(&view, &ns(), None).unwrap();
        match c.lifecycle {
            Some(LifecycleEvent::Dropped { reason }) => assert!(reason.contains("db.staging")),
            other => panic!("expected drop, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_other_operation() {
        let records = raw(&[FeedEvent::other("modify", "t1", ts(1), &ns())]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch(&view, &ns(), None).unwrap();
        assert!(matches!(
            c.lifecycle,
            Some(LifecycleEvent::UnrecognizedOperation { .. })
        ));
    }

    #[test]
    fn test_tail_classification_decodes_only_tail() {
        let mut events: Vec<FeedEvent> = (0..10)
            .map(|i| FeedEvent::delete(&format!("t{i}"), ts(i), &ns(), DocumentKey::Int(i.into())))
            .collect();
        events.push(FeedEvent::invalidate("t10", ts(10), &ns()));
        let records = raw(&events);
        let view = LazyDecodeView::new(&records);

        let c = classify_batch_tail(&view, &ns(), None).unwrap();
        assert_eq!(c.mutation_count, 10);
        assert!(matches!(c.lifecycle, Some(LifecycleEvent::Invalidated(_))));
        assert_eq!(view.decoded_count(), 2);
    }

    #[test]
    fn test_tail_classification_rename_pair() {
        let dest = Namespace::new("db", "b");
        let records = raw(&[
            FeedEvent::delete("t0", ts(1), &ns(), DocumentKey::Int(1)),
            FeedEvent::delete("t1", ts(2), &ns(), DocumentKey::Int(2)),
            FeedEvent::rename("t2", ts(3), &ns(), Some(dest.clone())),
            FeedEvent::invalidate("t3", ts(3), &ns()),
        ]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch_tail(&view, &ns(), None).unwrap();
        assert_eq!(c.mutation_count, 2);
        assert!(matches!(
            c.lifecycle,
            Some(LifecycleEvent::Renamed(ref info)) if info.resume_token.as_str() == "t3"
        ));
        assert_eq!(view.decoded_count(), 2);
    }

    #[test]
    fn test_tail_classification_pending_rename_checks_first() {
        let records = raw(&[
            FeedEvent::delete("t0", ts(1), &ns(), DocumentKey::Int(1)),
            FeedEvent::delete("t1", ts(2), &ns(), DocumentKey::Int(2)),
        ]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch_tail(&view, &ns(), Some(Namespace::new("db", "b"))).unwrap();
        assert_eq!(c.mutation_count, 0);
        assert!(matches!(
            c.lifecycle,
            Some(LifecycleEvent::UnconfirmedRename { .. })
        ));
        assert_eq!(view.decoded_count(), 1);
    }

    #[test]
    fn test_tail_classification_no_lifecycle() {
        let records = raw(&[
            FeedEvent::delete("t0", ts(1), &ns(), DocumentKey::Int(1)),
            FeedEvent::delete("t1", ts(2), &ns(), DocumentKey::Int(2)),
            FeedEvent::delete("t2", ts(3), &ns(), DocumentKey::Int(3)),
        ]);
        let view = LazyDecodeView::new(&records);
        let c = classify_batch_tail(&view, &ns(), None).unwrap();
        assert_eq!(c.mutation_count, 3);
        assert!(!c.has_lifecycle());
    }

    #[test]
    fn test_select_resume_empty_batch_uses_post_batch() {
        let batch = FeedBatch::from_events(&[], "pbrt", ts(9));
        let view = LazyDecodeView::new(&batch.events);
        let info = select_resume_info(&batch, &view, &ns()).unwrap().unwrap();
        assert_eq!(info.resume_token.as_str(), "pbrt");
        assert_eq!(info.operation_time, ts(9));
    }

    #[test]
    fn test_select_resume_skips_invalidate() {
        let batch = FeedBatch::from_events(
            &[
                FeedEvent::update("u1", ts(3), &ns(), DocumentKey::Int(1), touch("a")),
                FeedEvent::invalidate("inv", ts(4), &ns()),
            ],
            "pbrt",
            ts(4),
        );
        let view = LazyDecodeView::new(&batch.events);
        let info = select_resume_info(&batch, &view, &ns()).unwrap().unwrap();
        assert_eq!(info.resume_token.as_str(), "u1");
        assert_eq!(info.operation_time, ts(3));
    }

    #[test]
    fn test_select_resume_all_invalidating() {
        let batch = FeedBatch::from_events(
            &[
                FeedEvent::drop_collection("d", ts(4), &ns()),
                FeedEvent::invalidate("inv", ts(4), &ns()),
            ],
            "pbrt",
            ts(4),
        );
        let view = LazyDecodeView::new(&batch.events);
        assert!(select_resume_info(&batch, &view, &ns()).unwrap().is_none());
    }

    #[test]
    fn test_update_description_paths() {
        let mut update = touch("a.b");
        update.removed_fields.push("c".to_string());
        update.truncated_arrays.push("d".to_string());
        let paths: Vec<_> = update.paths().collect();
        assert_eq!(paths, vec!["a.b", "c", "d"]);
    }
}
