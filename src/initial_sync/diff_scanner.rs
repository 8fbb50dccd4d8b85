//! Diff scanning against a materialized view.
//!
//! Instead of re-indexing every scanned document, an auto-embedding index
//! compares each source page with the matching key range of its
//! materialized view and emits only the repair:
//!
//! ```text
//! source:  1 ── 2 ────── 4          view:  1 ────── 3 ── 4'
//!
//!          1 = 1   → nothing
//!          2 < 3   → Insert(2)
//!          3 only  → Delete(3)
//!          4 ≠ 4'  → Update(4) + vectors still valid for 4
//! ```
//!
//! Both inputs must be sorted ascending by [`DocumentKey`], which is the
//! order the key-order scan and [`MaterializedView::range`] produce.

use crate::batch::{DocumentEvent, DocumentEventBatch};
use crate::error::Result;
use crate::interfaces::{MaterializedView, ViewEntry};
use crate::model::{document_key, Document, DocumentKey, IndexMapping};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

/// Look up a dotted path in a document.
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = doc.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Fingerprint of one field value. Missing and `null` hash the same.
pub fn field_fingerprint(value: Option<&Value>) -> String {
    let bytes = serde_json::to_vec(value.unwrap_or(&Value::Null)).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Fingerprint of everything the mapping indexes.
///
/// A dynamic mapping fingerprints the whole document.
pub fn document_fingerprint(doc: &Document, mapping: &IndexMapping) -> String {
    let mut hasher = Sha256::new();
    if mapping.dynamic {
        hasher.update(serde_json::to_vec(doc).unwrap_or_default());
    } else {
        let mut paths: Vec<&str> = mapping.indexed_paths().collect();
        paths.sort_unstable();
        paths.dedup();
        for path in paths {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            let value = lookup(doc, path).unwrap_or(&Value::Null);
            hasher.update(serde_json::to_vec(value).unwrap_or_default());
            hasher.update([0xffu8]);
        }
    }
    hex::encode(hasher.finalize())
}

/// Per-embedded-field fingerprints, compared against the view's
/// `source_fingerprint` to decide which vectors can be reused.
pub fn embedded_fingerprints(doc: &Document, mapping: &IndexMapping) -> BTreeMap<String, String> {
    mapping
        .embedded_fields
        .iter()
        .map(|path| (path.clone(), field_fingerprint(lookup(doc, path))))
        .collect()
}

/// Merge-join a sorted source page with the sorted view entries of the
/// same key range.
pub fn diff_sorted(
    source: Vec<(DocumentKey, Document)>,
    view: Vec<ViewEntry>,
    mapping: &IndexMapping,
) -> Vec<DocumentEvent> {
    let mut events = Vec::new();
    let mut source = source.into_iter().peekable();
    let mut view = view.into_iter().peekable();

    loop {
        let order = match (source.peek(), view.peek()) {
            (Some((key, _)), Some(entry)) => key.cmp(&entry.key),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => break,
        };
        match order {
            Ordering::Less => {
                if let Some((key, doc)) = source.next() {
                    events.push(DocumentEvent::insert(key, doc));
                }
            }
            Ordering::Greater => {
                if let Some(entry) = view.next() {
                    events.push(DocumentEvent::delete(entry.key));
                }
            }
            Ordering::Equal => {
                if let (Some((key, doc)), Some(entry)) = (source.next(), view.next()) {
                    if document_fingerprint(&doc, mapping) != entry.fingerprint {
                        let reused = entry.reusable_vectors(&embedded_fingerprints(&doc, mapping));
                        events.push(DocumentEvent::update(key, doc, reused));
                    }
                }
            }
        }
    }
    events
}

/// Result of diffing one scanned page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiffPage {
    pub batch: DocumentEventBatch,
    /// Largest key of the scanned page: the page boundary the scan
    /// position advances to, whether or not the diff found anything.
    pub last_key: Option<DocumentKey>,
}

/// Computes repair diffs for key-order scan pages.
pub struct DiffScanner {
    view: Arc<dyn MaterializedView>,
    mapping: IndexMapping,
}

impl DiffScanner {
    pub fn new(view: Arc<dyn MaterializedView>, mapping: IndexMapping) -> Self {
        Self { view, mapping }
    }

    /// Diff a source page against the view.
    ///
    /// `lower` is the bound the page was scanned from. When more pages
    /// follow, the view is read up to the page's last key (inclusive);
    /// for the final page it is read to the end so trailing view entries
    /// are deleted.
    pub async fn diff_page(
        &self,
        documents: Vec<Document>,
        lower: Bound<DocumentKey>,
        more_pages: bool,
    ) -> Result<DiffPage> {
        let witnessed = documents.len();
        let mut skipped_keyless = 0;
        let mut keyed = Vec::with_capacity(documents.len());
        for doc in documents {
            match document_key(&doc) {
                Some(key) => keyed.push((key, doc)),
                None => skipped_keyless += 1,
            }
        }
        let last_key = keyed.last().map(|(key, _)| key.clone());

        let upper = match (&last_key, more_pages) {
            (_, false) => Some(Bound::Unbounded),
            (Some(key), true) => Some(Bound::Included(key.clone())),
            // Nothing keyed on this page and more to come: empty range.
            (None, true) => None,
        };
        let view = match upper {
            Some(upper) => self.view.range(lower, upper).await?,
            None => Vec::new(),
        };

        let events = diff_sorted(keyed, view, &self.mapping);
        Ok(DiffPage {
            batch: DocumentEventBatch {
                applicable: events.len(),
                events,
                witnessed,
                skipped_keyless,
            },
            last_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::DocumentEventKind;
    use crate::interfaces::{BoxFuture, EmbeddedField};
    use serde_json::json;
    use std::ops::RangeBounds;
    use std::sync::Mutex;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap_or_default()
    }

    fn keyed(v: Value) -> (DocumentKey, Document) {
        let d = doc(v);
        (document_key(&d).unwrap(), d)
    }

    fn entry_for(v: Value, mapping: &IndexMapping) -> ViewEntry {
        let d = doc(v);
        ViewEntry {
            key: document_key(&d).unwrap(),
            fingerprint: document_fingerprint(&d, mapping),
            embedded: BTreeMap::new(),
        }
    }

    #[test]
    fn test_diff_example() {
        let mapping = IndexMapping::dynamic();
        let source = vec![keyed(json!({"_id": 1, "v": "a"})), keyed(json!({"_id": 2, "v": "b"}))];
        let view = vec![
            entry_for(json!({"_id": 1, "v": "a"}), &mapping),
            entry_for(json!({"_id": 3, "v": "c"}), &mapping),
        ];

        let events = diff_sorted(source, view, &mapping);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, DocumentEventKind::Insert);
        assert_eq!(events[0].key, DocumentKey::Int(2));
        assert_eq!(events[0].document.as_ref().unwrap()["v"], json!("b"));
        assert_eq!(events[1], DocumentEvent::delete(DocumentKey::Int(3)));
    }

    #[test]
    fn test_unmapped_change_is_not_an_update() {
        let mapping = IndexMapping::with_fields(["title"]);
        let source = vec![keyed(json!({"_id": 1, "title": "t", "views": 10}))];
        let view = vec![entry_for(json!({"_id": 1, "title": "t", "views": 3}), &mapping)];
        assert!(diff_sorted(source, view, &mapping).is_empty());
    }

    #[test]
    fn test_changed_document_reuses_unchanged_vectors() {
        let mapping = IndexMapping::with_fields(["title"]).with_embedded_fields(["plot", "summary"]);
        let old = doc(json!({"_id": 7, "title": "old", "plot": "p", "summary": "s"}));
        let mut embedded = BTreeMap::new();
        embedded.insert(
            "plot".to_string(),
            EmbeddedField {
                source_fingerprint: field_fingerprint(lookup(&old, "plot")),
                vector: vec![0.5],
            },
        );
        embedded.insert(
            "summary".to_string(),
            EmbeddedField {
                source_fingerprint: field_fingerprint(lookup(&old, "summary")),
                vector: vec![0.25],
            },
        );
        let view = vec![ViewEntry {
            key: DocumentKey::Int(7),
            fingerprint: document_fingerprint(&old, &mapping),
            embedded,
        }];
        let source = vec![keyed(json!({"_id": 7, "title": "new", "plot": "p", "summary": "changed"}))];

        let events = diff_sorted(source, view, &mapping);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, DocumentEventKind::Update);
        let reused = events[0].reused_vectors.as_ref().unwrap();
        assert_eq!(reused.len(), 1);
        assert_eq!(reused["plot"], vec![0.5]);
    }

    #[test]
    fn test_mixed_key_types_follow_key_order() {
        let mapping = IndexMapping::dynamic();
        let source = vec![keyed(json!({"_id": 5})), keyed(json!({"_id": "a"}))];
        let view = vec![entry_for(json!({"_id": "a"}), &mapping)];
        let events = diff_sorted(source, view, &mapping);
        assert_eq!(events, vec![DocumentEvent::insert(DocumentKey::Int(5), doc(json!({"_id": 5})))]);
    }

    #[test]
    fn test_lookup_nested_path() {
        let d = doc(json!({"a": {"b": {"c": 1}}, "x": 2}));
        assert_eq!(lookup(&d, "a.b.c"), Some(&json!(1)));
        assert_eq!(lookup(&d, "x"), Some(&json!(2)));
        assert_eq!(lookup(&d, "a.z"), None);
        assert_eq!(lookup(&d, "x.y"), None);
    }

    #[test]
    fn test_fingerprint_ignores_field_order_of_mapping() {
        let d = doc(json!({"_id": 1, "a": 1, "b": 2}));
        let ab = IndexMapping::with_fields(["a", "b"]);
        let ba = IndexMapping::with_fields(["b", "a"]);
        assert_eq!(document_fingerprint(&d, &ab), document_fingerprint(&d, &ba));
    }

    struct StaticView {
        entries: Vec<ViewEntry>,
        requests: Mutex<Vec<(Bound<DocumentKey>, Bound<DocumentKey>)>>,
    }

    impl MaterializedView for StaticView {
        fn range(
            &self,
            lower: Bound<DocumentKey>,
            upper: Bound<DocumentKey>,
        ) -> BoxFuture<'_, Vec<ViewEntry>> {
            self.requests.lock().unwrap().push((lower.clone(), upper.clone()));
            let entries = self
                .entries
                .iter()
                .filter(|e| (lower.as_ref(), upper.as_ref()).contains(&e.key))
                .cloned()
                .collect();
            Box::pin(async move { Ok(entries) })
        }
    }

    #[tokio::test]
    async fn test_diff_page_bounds_and_keyless_skip() {
        let mapping = IndexMapping::dynamic();
        let view = Arc::new(StaticView {
            entries: vec![
                entry_for(json!({"_id": 2}), &mapping),
                entry_for(json!({"_id": 9}), &mapping),
            ],
            requests: Mutex::new(Vec::new()),
        });
        let scanner = DiffScanner::new(view.clone(), mapping);

        let page = vec![doc(json!({"_id": 2})), doc(json!({"nokey": true})), doc(json!({"_id": 4}))];
        let result = scanner
            .diff_page(page, Bound::Excluded(DocumentKey::Int(1)), true)
            .await
            .unwrap();

        assert_eq!(result.last_key, Some(DocumentKey::Int(4)));
        assert_eq!(result.batch.skipped_keyless, 1);
        assert_eq!(result.batch.witnessed, 3);
        // 2 unchanged, 4 inserted; 9 is beyond this page's range.
        assert_eq!(result.batch.events.len(), 1);
        assert_eq!(result.batch.events[0].key, DocumentKey::Int(4));
        assert_eq!(
            view.requests.lock().unwrap()[0],
            (Bound::Excluded(DocumentKey::Int(1)), Bound::Included(DocumentKey::Int(4)))
        );
    }

    #[tokio::test]
    async fn test_last_page_reads_view_to_the_end() {
        let mapping = IndexMapping::dynamic();
        let view = Arc::new(StaticView {
            entries: vec![entry_for(json!({"_id": 9}), &mapping)],
            requests: Mutex::new(Vec::new()),
        });
        let scanner = DiffScanner::new(view, mapping);

        let result = scanner
            .diff_page(Vec::new(), Bound::Excluded(DocumentKey::Int(4)), false)
            .await
            .unwrap();
        assert_eq!(result.batch.events, vec![DocumentEvent::delete(DocumentKey::Int(9))]);
        assert_eq!(result.last_key, None);
    }
}
