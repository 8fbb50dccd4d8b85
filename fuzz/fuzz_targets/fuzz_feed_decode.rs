//! Fuzz target for change feed record decoding.
//!
//! Decoding and classifying arbitrary bytes must fail with an error,
//! never panic.

#![no_main]

use index_replication::feed::{classify_batch, classify_batch_tail, LazyDecodeView, RawFeedEvent};
use index_replication::model::Namespace;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|records: Vec<Vec<u8>>| {
    let raw: Vec<RawFeedEvent> = records.into_iter().map(RawFeedEvent::new).collect();
    for record in &raw {
        let _ = record.decode();
    }

    let ours = Namespace::new("db", "coll");
    let view = LazyDecodeView::new(&raw);
    let _ = classify_batch(&view, &ours, None);
    let _ = classify_batch_tail(&view, &ours, Some(ours.with_collection("moved")));
});
