#![allow(dead_code)]

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-memory source database with a replayable change feed
//! - A recording `Indexer` that commits resume metadata to a checkpoint store
//! - Document and namespace helpers

pub mod indexer;
pub mod oplog;

pub use indexer::*;
pub use oplog::*;

use index_replication::model::{Document, Namespace, Timestamp};

pub fn ns() -> Namespace {
    Namespace::new("db", "coll")
}

pub fn doc(value: serde_json::Value) -> Document {
    value.as_object().cloned().unwrap_or_default()
}

pub fn ts(seconds: u32) -> Timestamp {
    Timestamp::new(seconds, 0)
}
