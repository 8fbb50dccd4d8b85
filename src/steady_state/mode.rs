//! Projection-mode selection for steady-state feeds.
//!
//! Large collections whose documents are much bigger than the indexed part
//! are cheaper to tail with an indexed-fields-only projection. Small
//! collections are never worth the cursor restart.
//!
//! Statistics are re-sampled through [`ModeSelector::refresh`], which the
//! change-feed client calls every `mode_refresh_period` while tailing; a
//! selection made there takes effect at the next batch boundary.

use crate::interfaces::{BoxFuture, CollectionStats, ModeSelector, SourceClient};
use crate::model::{GenerationId, Namespace, ProjectionMode};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Collections at or below this many documents keep the default projection.
pub const MIN_DOCUMENTS_FOR_SELECTION: u64 = 10_000;

/// Full-to-projected size ratio at which projecting pays off.
pub const PROJECTION_SIZE_RATIO: f64 = 8.0;

/// Picks a projection per generation from sampled collection statistics.
#[derive(Debug, Default)]
pub struct HeuristicModeSelector {
    selections: RwLock<HashMap<GenerationId, ProjectionMode>>,
    overrides: RwLock<HashMap<GenerationId, ProjectionMode>>,
}

impl HeuristicModeSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mode the statistics call for, or `None` when the collection is
    /// too small to decide.
    pub fn choose(stats: &CollectionStats) -> Option<ProjectionMode> {
        if stats.document_count <= MIN_DOCUMENTS_FOR_SELECTION {
            return None;
        }
        if stats.avg_projected_bytes > 0.0
            && stats.avg_document_bytes / stats.avg_projected_bytes >= PROJECTION_SIZE_RATIO
        {
            Some(ProjectionMode::IndexedFieldsOnly)
        } else {
            Some(ProjectionMode::AllFields)
        }
    }

    /// Record a selection from fresh statistics.
    pub fn observe(&self, generation: &GenerationId, stats: &CollectionStats) {
        if let Some(mode) = Self::choose(stats) {
            debug!(generation = %generation, mode = ?mode, "Projection mode selected");
            self.selections
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(generation.clone(), mode);
        }
    }

    /// Force a mode regardless of statistics. `None` clears the override.
    pub fn set_override(&self, generation: &GenerationId, mode: Option<ProjectionMode>) {
        let mut overrides = self.overrides.write().unwrap_or_else(PoisonError::into_inner);
        match mode {
            Some(mode) => overrides.insert(generation.clone(), mode),
            None => overrides.remove(generation),
        };
    }

    /// Drop all state for a retired generation.
    pub fn remove(&self, generation: &GenerationId) {
        self.selections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(generation);
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(generation);
    }
}

impl ModeSelector for HeuristicModeSelector {
    fn mode(&self, generation: &GenerationId) -> ProjectionMode {
        let overridden = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(generation)
            .copied();
        overridden
            .or_else(|| {
                self.selections
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(generation)
                    .copied()
            })
            .unwrap_or_default()
    }

    /// Sample the collection and update the selection.
    fn refresh<'a>(
        &'a self,
        generation: &'a GenerationId,
        source: &'a dyn SourceClient,
        namespace: &'a Namespace,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if let Some(stats) = source.collection_stats(namespace).await? {
                self.observe(generation, &stats);
            }
            Ok(())
        })
    }

    fn forget(&self, generation: &GenerationId) {
        self.remove(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Timestamp;
    use crate::test_support::{ns, ScriptedSource};

    fn stats(count: u64, full: f64, projected: f64) -> CollectionStats {
        CollectionStats {
            document_count: count,
            avg_document_bytes: full,
            avg_projected_bytes: projected,
        }
    }

    #[test]
    fn test_small_collections_are_undecided() {
        assert_eq!(HeuristicModeSelector::choose(&stats(10_000, 8000.0, 10.0)), None);
        assert_eq!(
            HeuristicModeSelector::choose(&stats(10_001, 8000.0, 10.0)),
            Some(ProjectionMode::IndexedFieldsOnly)
        );
    }

    #[test]
    fn test_ratio_threshold() {
        assert_eq!(
            HeuristicModeSelector::choose(&stats(50_000, 800.0, 100.0)),
            Some(ProjectionMode::IndexedFieldsOnly)
        );
        assert_eq!(
            HeuristicModeSelector::choose(&stats(50_000, 799.0, 100.0)),
            Some(ProjectionMode::AllFields)
        );
        assert_eq!(
            HeuristicModeSelector::choose(&stats(50_000, 800.0, 0.0)),
            Some(ProjectionMode::AllFields)
        );
    }

    #[test]
    fn test_default_until_selected() {
        let selector = HeuristicModeSelector::new();
        let generation = GenerationId::new("idx", 1);
        assert_eq!(selector.mode(&generation), ProjectionMode::AllFields);

        selector.observe(&generation, &stats(20_000, 1000.0, 10.0));
        assert_eq!(selector.mode(&generation), ProjectionMode::IndexedFieldsOnly);
        assert_eq!(selector.mode(&GenerationId::new("idx", 2)), ProjectionMode::AllFields);
    }

    #[tokio::test]
    async fn test_refresh_samples_source() {
        let source = ScriptedSource::new(Timestamp::new(1, 0));
        let selector = HeuristicModeSelector::new();
        let generation = GenerationId::new("idx", 1);

        selector.refresh(&generation, &source, &ns()).await.unwrap();
        assert_eq!(selector.mode(&generation), ProjectionMode::AllFields);

        source.set_stats(Some(stats(20_000, 1000.0, 10.0)));
        selector.refresh(&generation, &source, &ns()).await.unwrap();
        assert_eq!(selector.mode(&generation), ProjectionMode::IndexedFieldsOnly);
        assert_eq!(source.state.lock().unwrap().stats_requests, 2);

        ModeSelector::forget(&selector, &generation);
        assert_eq!(selector.mode(&generation), ProjectionMode::AllFields);
    }

    #[test]
    fn test_override_wins() {
        let selector = HeuristicModeSelector::new();
        let generation = GenerationId::new("idx", 1);
        selector.observe(&generation, &stats(20_000, 1000.0, 10.0));
        selector.set_override(&generation, Some(ProjectionMode::AllFields));
        assert_eq!(selector.mode(&generation), ProjectionMode::AllFields);

        selector.set_override(&generation, None);
        assert_eq!(selector.mode(&generation), ProjectionMode::IndexedFieldsOnly);

        selector.remove(&generation);
        assert_eq!(selector.mode(&generation), ProjectionMode::AllFields);
    }
}
