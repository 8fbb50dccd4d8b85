//! Initial sync phase types.
//!
//! # Phase Transitions
//!
//! ```text
//!                       run()
//! ResumingOrFresh ─────────────────→ Scanning ←───────────┐
//!        │                              │                 │
//!        │ (already committed)          │ (page budget    │ (more to scan)
//!        │                              │  spent or done) │
//!        │                              ↓                 │
//!        │                          CatchingUp ───────────┘
//!        │                              │
//!        │                              │ (collection fully scanned)
//!        │                              ↓
//!        │                          ReducingLag
//!        │                              │
//!        │                              ↓
//!        │                          Committing
//!        │                              │
//!        └────────────────────────→ Committed
//!
//!   any phase ──(error / shutdown)──→ Failed
//! ```

/// Where an initial sync attempt currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialSyncPhase {
    /// Reading persisted resume metadata and choosing a start point.
    #[default]
    ResumingOrFresh,

    /// Paging through the collection under the scan time budget.
    Scanning,

    /// Tailing the feed until it reaches the time the scan round ended.
    CatchingUp,

    /// Optional final tailing to shrink lag before the hand-off.
    ReducingLag,

    /// Issuing the first commit with the feed resume position attached.
    Committing,

    /// Hand-off position committed. Steady state may start.
    Committed,

    /// The attempt ended with an error (shutdown included).
    Failed,
}

impl InitialSyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InitialSyncPhase::ResumingOrFresh => "resuming_or_fresh",
            InitialSyncPhase::Scanning => "scanning",
            InitialSyncPhase::CatchingUp => "catching_up",
            InitialSyncPhase::ReducingLag => "reducing_lag",
            InitialSyncPhase::Committing => "committing",
            InitialSyncPhase::Committed => "committed",
            InitialSyncPhase::Failed => "failed",
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, InitialSyncPhase::Committed | InitialSyncPhase::Failed)
    }
}

impl std::fmt::Display for InitialSyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InitialSyncPhase::ResumingOrFresh => write!(f, "ResumingOrFresh"),
            InitialSyncPhase::Scanning => write!(f, "Scanning"),
            InitialSyncPhase::CatchingUp => write!(f, "CatchingUp"),
            InitialSyncPhase::ReducingLag => write!(f, "ReducingLag"),
            InitialSyncPhase::Committing => write!(f, "Committing"),
            InitialSyncPhase::Committed => write!(f, "Committed"),
            InitialSyncPhase::Failed => write!(f, "Failed"),
        }
    }
}
