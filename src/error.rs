// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error taxonomy shared by initial sync and steady state.
//!
//! Every failure the engine surfaces is one of a closed set of kinds, and
//! each kind maps to exactly one propagation policy. Callers match
//! exhaustively on [`SyncError`] instead of inspecting messages.
//!
//! # Error Kinds
//!
//! | Kind | Policy | Carries |
//! |------|--------|---------|
//! | `Transient` | Retry with backoff; checkpoint untouched | message |
//! | `RequiresResync` | Discard state, initial sync from scratch | message |
//! | `NonInvalidatingResync` | Resync without invalidating the live index first | message |
//! | `Invalidated` | Restart tailing (or the scan) from the carried position | [`ResumeInfo`] |
//! | `Renamed` | Terminal; redirect the index to the new namespace | [`FeedResumeInfo`] |
//! | `Dropped` | Terminal; tear the index down | message |
//! | `ShutDown` | Cooperative cancellation, not a failure | - |
//! | `FieldLimitExceeded` | Mark the generation invalid and surface it | message |
//! | `DocumentLimitExceeded` | Mark the generation invalid and surface it | message |
//!
//! # Shutdown Precedence
//!
//! When a failure races with cooperative cancellation, `ShutDown` wins. Use
//! [`SyncError::prefer_shutdown`] at every boundary that knows whether a
//! shutdown was requested.

use crate::model::{FeedResumeInfo, ResumeInfo};
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Replication failure, classified by how the caller must react.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    /// Temporary condition (network, storage, drain timeout).
    ///
    /// Retryable. Does not advance or discard the checkpoint.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Replication state is unusable; restart initial sync from scratch.
    #[error("Requires resync: {0}")]
    RequiresResync(String),

    /// Resync needed, but the currently served index stays valid meanwhile.
    #[error("Requires resync (non-invalidating): {0}")]
    NonInvalidatingResync(String),

    /// The feed cursor was invalidated; resume from the carried position.
    #[error("Change feed invalidated")]
    Invalidated(ResumeInfo),

    /// The source collection was renamed; resume on the new namespace.
    #[error("Collection renamed to {}", .0.namespace)]
    Renamed(FeedResumeInfo),

    /// The source collection (or its database) is gone.
    #[error("Collection dropped: {0}")]
    Dropped(String),

    /// Cooperative cancellation. Not a failure.
    #[error("Shut down")]
    ShutDown,

    /// A document produced more index fields than allowed.
    #[error("Field limit exceeded: {0}")]
    FieldLimitExceeded(String),

    /// The index holds more documents than allowed.
    #[error("Document limit exceeded: {0}")]
    DocumentLimitExceeded(String),
}

/// Label-friendly discriminant of [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncErrorKind {
    Transient,
    RequiresResync,
    NonInvalidatingResync,
    Invalidated,
    Renamed,
    Dropped,
    ShutDown,
    FieldLimitExceeded,
    DocumentLimitExceeded,
}

impl SyncErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RequiresResync => "requires_resync",
            Self::NonInvalidatingResync => "non_invalidating_resync",
            Self::Invalidated => "invalidated",
            Self::Renamed => "renamed",
            Self::Dropped => "dropped",
            Self::ShutDown => "shut_down",
            Self::FieldLimitExceeded => "field_limit_exceeded",
            Self::DocumentLimitExceeded => "document_limit_exceeded",
        }
    }
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn requires_resync(message: impl Into<String>) -> Self {
        Self::RequiresResync(message.into())
    }

    pub fn dropped(message: impl Into<String>) -> Self {
        Self::Dropped(message.into())
    }

    pub fn kind(&self) -> SyncErrorKind {
        match self {
            Self::Transient(_) => SyncErrorKind::Transient,
            Self::RequiresResync(_) => SyncErrorKind::RequiresResync,
            Self::NonInvalidatingResync(_) => SyncErrorKind::NonInvalidatingResync,
            Self::Invalidated(_) => SyncErrorKind::Invalidated,
            Self::Renamed(_) => SyncErrorKind::Renamed,
            Self::Dropped(_) => SyncErrorKind::Dropped,
            Self::ShutDown => SyncErrorKind::ShutDown,
            Self::FieldLimitExceeded(_) => SyncErrorKind::FieldLimitExceeded,
            Self::DocumentLimitExceeded(_) => SyncErrorKind::DocumentLimitExceeded,
        }
    }

    /// Check if the owning manager should retry with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::RequiresResync(_) => false,
            Self::NonInvalidatingResync(_) => false,
            Self::Invalidated(_) => false,
            Self::Renamed(_) => false,
            Self::Dropped(_) => false,
            Self::ShutDown => false,
            Self::FieldLimitExceeded(_) => false,
            Self::DocumentLimitExceeded(_) => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::ShutDown)
    }

    /// Either flavour of "start initial sync over".
    pub fn is_resync(&self) -> bool {
        matches!(self, Self::RequiresResync(_) | Self::NonInvalidatingResync(_))
    }

    /// The generation is finished and must not be retried as-is.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Dropped(_)
                | Self::Renamed(_)
                | Self::FieldLimitExceeded(_)
                | Self::DocumentLimitExceeded(_)
        )
    }

    pub fn is_limit_exceeded(&self) -> bool {
        matches!(
            self,
            Self::FieldLimitExceeded(_) | Self::DocumentLimitExceeded(_)
        )
    }

    /// Resume position to restart from, for `Invalidated` and `Renamed`.
    pub fn resume_info(&self) -> Option<ResumeInfo> {
        match self {
            Self::Invalidated(info) => Some(info.clone()),
            Self::Renamed(info) => Some(ResumeInfo::ChangeFeed(info.clone())),
            _ => None,
        }
    }

    /// Collapse to `ShutDown` when a shutdown was requested concurrently.
    pub fn prefer_shutdown(self, shutting_down: bool) -> Self {
        if shutting_down {
            Self::ShutDown
        } else {
            self
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        Self::Transient(format!("checkpoint store: {e}"))
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Transient(format!("worker task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        InitialSyncResumeInfo, Namespace, ResumeToken, ScanPosition, Timestamp,
    };

    fn feed_info() -> FeedResumeInfo {
        FeedResumeInfo {
            namespace: Namespace::new("db", "renamed"),
            resume_token: ResumeToken::new("tok"),
            operation_time: Timestamp::new(10, 0),
        }
    }

    #[test]
    fn test_is_retryable_transient() {
        let err = SyncError::transient("connection reset");
        assert!(err.is_retryable());
        assert!(err.is_transient());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_not_retryable_resync() {
        let err = SyncError::requires_resync("unknown event");
        assert!(!err.is_retryable());
        assert!(err.is_resync());
        assert!(SyncError::NonInvalidatingResync("rename".into()).is_resync());
    }

    #[test]
    fn test_not_retryable_shutdown() {
        assert!(!SyncError::ShutDown.is_retryable());
        assert!(SyncError::ShutDown.is_shutdown());
        assert!(!SyncError::ShutDown.is_terminal());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(SyncError::dropped("gone").is_terminal());
        assert!(SyncError::Renamed(feed_info()).is_terminal());
        assert!(SyncError::FieldLimitExceeded("x".into()).is_terminal());
        assert!(SyncError::DocumentLimitExceeded("x".into()).is_limit_exceeded());
        assert!(!SyncError::transient("x").is_terminal());
    }

    #[test]
    fn test_renamed_message_names_destination() {
        let err = SyncError::Renamed(feed_info());
        assert!(err.to_string().contains("db.renamed"));
        assert_eq!(
            err.resume_info(),
            Some(ResumeInfo::ChangeFeed(feed_info()))
        );
    }

    #[test]
    fn test_invalidated_carries_resume_info() {
        let info = ResumeInfo::InitialSync(InitialSyncResumeInfo {
            high_water_mark: Timestamp::new(4, 2),
            last_scanned: ScanPosition::Key(None),
            sync_source_host: None,
        });
        let err = SyncError::Invalidated(info.clone());
        assert_eq!(err.resume_info(), Some(info));
        assert_eq!(err.kind(), SyncErrorKind::Invalidated);
    }

    #[test]
    fn test_prefer_shutdown() {
        let err = SyncError::dropped("gone");
        assert_eq!(err.clone().prefer_shutdown(false), err);
        assert_eq!(err.prefer_shutdown(true), SyncError::ShutDown);
    }

    #[test]
    fn test_kind_labels_are_distinct() {
        let kinds = [
            SyncErrorKind::Transient,
            SyncErrorKind::RequiresResync,
            SyncErrorKind::NonInvalidatingResync,
            SyncErrorKind::Invalidated,
            SyncErrorKind::Renamed,
            SyncErrorKind::Dropped,
            SyncErrorKind::ShutDown,
            SyncErrorKind::FieldLimitExceeded,
            SyncErrorKind::DocumentLimitExceeded,
        ];
        let labels: std::collections::HashSet<_> = kinds.iter().map(|k| k.as_str()).collect();
        assert_eq!(labels.len(), kinds.len());
    }
}
