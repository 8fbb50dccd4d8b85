// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication data model.
//!
//! Value types describing *where* replication is and *what* it replicates:
//!
//! - [`GenerationId`] / [`AttemptId`]: the keys every piece of scheduling,
//!   cancellation and checkpointing hangs off.
//! - [`Timestamp`], [`ResumeToken`], [`DocumentKey`]: positions in the change
//!   feed and in the collection scan.
//! - [`InitialSyncResumeInfo`], [`FeedResumeInfo`], [`CommitMetadata`]: the
//!   durable resume state attached to every index commit.
//! - [`IndexDefinition`] / [`IndexMapping`]: the narrow slice of an index
//!   definition the engine needs (namespace, indexed paths, scan order).
//!
//! None of these types has behavior beyond ordering and small accessors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A source document as delivered by the scan or the change feed.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Field holding the document key.
pub const KEY_FIELD: &str = "_id";

/// Extract the document key, if present and of a supported type.
///
/// Returns `None` for missing keys and for key types the engine cannot order
/// (objects, arrays, null, floats). Callers treat that as a corrupted record.
pub fn document_key(doc: &Document) -> Option<DocumentKey> {
    doc.get(KEY_FIELD).and_then(DocumentKey::from_value)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Generations and attempts
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifies one attempt at syncing one index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GenerationId {
    pub index_id: String,
    pub generation: u64,
}

impl GenerationId {
    pub fn new(index_id: impl Into<String>, generation: u64) -> Self {
        Self {
            index_id: index_id.into(),
            generation,
        }
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@g{}", self.index_id, self.generation)
    }
}

static NEXT_ATTEMPT: AtomicU64 = AtomicU64::new(1);

/// Scopes scheduled work to one attempt within a generation.
///
/// Work queued by a superseded attempt is never confused with work of the
/// current one: cancelling attempt N leaves batches of attempt N+1 alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttemptId(u64);

impl AttemptId {
    /// Allocate the next process-wide attempt id.
    pub fn next() -> Self {
        Self(NEXT_ATTEMPT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "attempt-{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Positions
// ═══════════════════════════════════════════════════════════════════════════════

/// Cluster operation time: seconds plus an increment within that second.
///
/// Ordered lexicographically, `seconds` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub seconds: u32,
    pub increment: u32,
}

impl Timestamp {
    pub const fn new(seconds: u32, increment: u32) -> Self {
        Self { seconds, increment }
    }

    /// The smallest timestamp strictly after this one.
    pub fn next_tick(self) -> Self {
        match self.increment.checked_add(1) {
            Some(increment) => Self::new(self.seconds, increment),
            None => Self::new(self.seconds.saturating_add(1), 0),
        }
    }

    /// Wall-clock distance from `self` to `later`, at second granularity.
    ///
    /// Zero when `later` is not after `self`.
    pub fn lag_until(self, later: Timestamp) -> Duration {
        Duration::from_secs(u64::from(later.seconds.saturating_sub(self.seconds)))
    }

    /// Parse the `seconds:increment` form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let (secs, inc) = s.split_once(':')?;
        Some(Self::new(secs.parse().ok()?, inc.parse().ok()?))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.increment)
    }
}

/// Opaque position token issued by the source (feed or natural-order scan).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a source document.
///
/// Keys of different types order by type class first (integers, then
/// strings, then binary), so a key-order scan and the diff scanner's
/// merge-join agree on a single total order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentKey {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
}

impl DocumentKey {
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Number(n) => n.as_i64().map(Self::Int),
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> serde_json::Value {
        match self {
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Str(s) => serde_json::Value::from(s.as_str()),
            Self::Bytes(b) => serde_json::Value::from(b.clone()),
        }
    }
}

impl From<i64> for DocumentKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for DocumentKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

/// `database.collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: String,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parse `db.coll`. The collection part may itself contain dots.
    pub fn parse(s: &str) -> Option<Self> {
        let (db, coll) = s.split_once('.')?;
        if db.is_empty() || coll.is_empty() {
            return None;
        }
        Some(Self::new(db, coll))
    }

    pub fn with_collection(&self, collection: impl Into<String>) -> Self {
        Self::new(self.database.clone(), collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Resume metadata
// ═══════════════════════════════════════════════════════════════════════════════

/// Order in which the collection scan visits documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScanMode {
    /// Storage order, resumed with a provider-issued token.
    NaturalOrder,
    /// Ascending document key, resumed with an exclusive lower bound.
    KeyOrder,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::NaturalOrder => write!(f, "natural"),
            ScanMode::KeyOrder => write!(f, "key"),
        }
    }
}

/// How far a collection scan has progressed. `None` means "from the start".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanPosition {
    Natural(Option<ResumeToken>),
    Key(Option<DocumentKey>),
}

impl ScanPosition {
    pub fn start(mode: ScanMode) -> Self {
        match mode {
            ScanMode::NaturalOrder => Self::Natural(None),
            ScanMode::KeyOrder => Self::Key(None),
        }
    }

    pub fn mode(&self) -> ScanMode {
        match self {
            Self::Natural(_) => ScanMode::NaturalOrder,
            Self::Key(_) => ScanMode::KeyOrder,
        }
    }

    pub fn is_start(&self) -> bool {
        matches!(self, Self::Natural(None) | Self::Key(None))
    }

    /// Last scanned key, for key-order positions.
    pub fn key(&self) -> Option<&DocumentKey> {
        match self {
            Self::Key(k) => k.as_ref(),
            Self::Natural(_) => None,
        }
    }
}

/// Where an interrupted initial sync picks up again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialSyncResumeInfo {
    /// Feed position already applied; reused inclusively on resume.
    pub high_water_mark: Timestamp,
    pub last_scanned: ScanPosition,
    /// Host the scan was reading from, when sync-source pinning is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_source_host: Option<String>,
}

impl InitialSyncResumeInfo {
    pub fn scan_mode(&self) -> ScanMode {
        self.last_scanned.mode()
    }
}

/// Position in the change feed from which steady state resumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedResumeInfo {
    pub namespace: Namespace,
    pub resume_token: ResumeToken,
    pub operation_time: Timestamp,
}

/// Either resume point. Carried by invalidation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResumeInfo {
    InitialSync(InitialSyncResumeInfo),
    ChangeFeed(FeedResumeInfo),
}

/// Metadata persisted atomically with an index commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_feed: Option<FeedResumeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_sync: Option<InitialSyncResumeInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exceeded_limits_reason: Option<String>,
}

impl CommitMetadata {
    pub fn change_feed(info: FeedResumeInfo) -> Self {
        Self {
            change_feed: Some(info),
            ..Self::default()
        }
    }

    pub fn initial_sync(info: InitialSyncResumeInfo) -> Self {
        Self {
            initial_sync: Some(info),
            ..Self::default()
        }
    }

    /// Marks the generation invalid, recording why.
    pub fn exceeded(reason: impl Into<String>) -> Self {
        Self {
            exceeded_limits_reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.change_feed.is_none()
            && self.initial_sync.is_none()
            && self.exceeded_limits_reason.is_none()
    }

    /// The op time this metadata guarantees has been applied.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.change_feed
            .as_ref()
            .map(|f| f.operation_time)
            .or_else(|| self.initial_sync.as_ref().map(|i| i.high_water_mark))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Index definition
// ═══════════════════════════════════════════════════════════════════════════════

/// Index flavour. Auto-embedding indexes call an external embedding API while
/// indexing, which affects fetch gating and shutdown timeouts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKind {
    #[default]
    Search,
    VectorSearch,
    AutoEmbedding,
}

impl IndexKind {
    pub fn is_auto_embedding(self) -> bool {
        matches!(self, IndexKind::AutoEmbedding)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Search => "search",
            IndexKind::VectorSearch => "vector_search",
            IndexKind::AutoEmbedding => "auto_embedding",
        }
    }
}

/// Which document paths the index cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMapping {
    /// Index every field.
    #[serde(default)]
    pub dynamic: bool,
    #[serde(default)]
    pub fields: Vec<String>,
    /// Paths whose values are turned into vectors by the embedding service.
    #[serde(default)]
    pub embedded_fields: Vec<String>,
}

impl IndexMapping {
    pub fn dynamic() -> Self {
        Self {
            dynamic: true,
            ..Self::default()
        }
    }

    pub fn with_fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_embedded_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.embedded_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Every explicitly mapped path, embedded ones included.
    pub fn indexed_paths(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .chain(self.embedded_fields.iter())
            .map(String::as_str)
    }

    /// Whether a change to `path` can affect the indexed representation.
    pub fn covers(&self, path: &str) -> bool {
        path == KEY_FIELD || self.dynamic || self.indexed_paths().any(|p| paths_overlap(p, path))
    }
}

/// Two dotted paths overlap when one is a prefix (at a segment boundary) of
/// the other: `a.b` overlaps `a` and `a.b.c` but not `a.bc`.
pub fn paths_overlap(a: &str, b: &str) -> bool {
    fn is_prefix(short: &str, long: &str) -> bool {
        long.len() > short.len()
            && long.starts_with(short)
            && long.as_bytes()[short.len()] == b'.'
    }
    a == b || is_prefix(a, b) || is_prefix(b, a)
}

/// The part of an index definition the replication engine consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub index_id: String,
    pub database: String,
    /// Collection name as last observed; may lag behind a rename.
    pub last_observed_collection: String,
    #[serde(default)]
    pub kind: IndexKind,
    #[serde(default)]
    pub mapping: IndexMapping,
    pub scan_mode: ScanMode,
}

impl IndexDefinition {
    pub fn new(index_id: impl Into<String>, namespace: &Namespace, mapping: IndexMapping) -> Self {
        Self {
            index_id: index_id.into(),
            database: namespace.database.clone(),
            last_observed_collection: namespace.collection.clone(),
            kind: IndexKind::Search,
            mapping,
            scan_mode: ScanMode::KeyOrder,
        }
    }

    pub fn with_kind(mut self, kind: IndexKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_scan_mode(mut self, scan_mode: ScanMode) -> Self {
        self.scan_mode = scan_mode;
        self
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(self.database.clone(), self.last_observed_collection.clone())
    }
}

/// Change-feed projection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProjectionMode {
    /// Full documents.
    #[default]
    AllFields,
    /// Only the paths the index maps.
    IndexedFieldsOnly,
}

/// Indexing priority. Variants earlier in the list are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    InitialSyncChangeFeed,
    SteadyStateChangeFeed,
    InitialSyncScan,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::InitialSyncChangeFeed => "initial_sync_change_feed",
            Priority::SteadyStateChangeFeed => "steady_state_change_feed",
            Priority::InitialSyncScan => "initial_sync_scan",
        }
    }
}
