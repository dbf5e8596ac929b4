//! Stage graph builder with validation.

use super::{GraphNode, StageGraph};
use crate::catalog::StageCatalog;
use crate::core::{FeatureFlags, StageDefinition, WorkflowMode};
use crate::errors::ConfigurationError;
use std::collections::HashSet;

/// Builds the concrete [`StageGraph`] for a workflow mode and flag set.
///
/// Stages whose flag is off are removed. Each remaining stage resolves its
/// successor from the catalog's route table when it has an entry, and
/// otherwise by walking the canonical chain to the nearest scheduled stage.
/// The resolved successor must be the stage scheduled right after it;
/// anything else would skip or repeat a stage and is rejected.
#[derive(Debug, Clone, Copy)]
pub struct GraphBuilder<'a> {
    catalog: &'a StageCatalog,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder over a catalog.
    #[must_use]
    pub fn new(catalog: &'a StageCatalog) -> Self {
        Self { catalog }
    }

    /// Builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if no stage is enabled or a
    /// non-terminal stage has no resolvable successor.
    pub fn build(
        &self,
        mode: WorkflowMode,
        flags: &FeatureFlags,
    ) -> Result<StageGraph, ConfigurationError> {
        let mut included: Vec<&StageDefinition> = Vec::new();
        let mut disabled = Vec::new();

        for stage in self.catalog.mode_sequence(mode) {
            let enabled = stage.flag.as_ref().map_or(true, |f| flags.is_enabled(f));
            if enabled {
                included.push(stage);
            } else {
                disabled.push(stage.name.clone());
            }
        }

        if included.is_empty() {
            return Err(ConfigurationError::new(format!(
                "workflow mode '{mode}' has no enabled stages"
            ))
            .with_stages(disabled));
        }

        let present: HashSet<&str> = included.iter().map(|s| s.name.as_str()).collect();
        let mut nodes = Vec::with_capacity(included.len());

        for (i, stage) in included.iter().enumerate() {
            let resolved = self.resolve_next(stage, &present);
            let scheduled = included.get(i + 1).map(|s| s.name.as_str());

            match (resolved, scheduled) {
                (None, None) => {}
                (Some(r), Some(s)) if r == s => {}
                (None, Some(s)) => {
                    return Err(ConfigurationError::new(format!(
                        "stage '{}' has no resolvable successor but '{s}' is scheduled after it",
                        stage.name
                    ))
                    .with_stages([stage.name.as_str(), s])
                    .with_fix_hint("Add the scheduled stage to the route table of the stage."));
                }
                (Some(r), s) => {
                    let s = s.unwrap_or("the terminal sentinel");
                    return Err(ConfigurationError::new(format!(
                        "stage '{}' routes to '{r}' but '{s}' is scheduled after it",
                        stage.name
                    ))
                    .with_stages([stage.name.as_str(), r])
                    .with_fix_hint("Check the flags of adjacent optional stages."));
                }
            }

            nodes.push(GraphNode {
                stage: (*stage).clone(),
                next: resolved.map(str::to_string),
            });
        }

        tracing::debug!(
            mode = %mode,
            stages = nodes.len(),
            disabled = ?disabled,
            "Built stage graph"
        );

        Ok(StageGraph::new(mode, nodes, disabled))
    }

    fn resolve_next<'s>(
        &'s self,
        stage: &StageDefinition,
        present: &HashSet<&str>,
    ) -> Option<&'s str> {
        if let Some(candidates) = self.catalog.route(&stage.name) {
            return candidates
                .iter()
                .map(String::as_str)
                .find(|c| present.contains(c));
        }

        let mut cursor = stage.canonical_next.as_deref();
        while let Some(name) = cursor {
            if present.contains(name) {
                return self.catalog.get(name).map(|s| s.name.as_str());
            }
            cursor = self
                .catalog
                .get(name)
                .and_then(|s| s.canonical_next.as_deref());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn media() -> StageCatalog {
        StageCatalog::media_default().unwrap()
    }

    fn pairs(graph: &StageGraph) -> Vec<(String, Option<String>)> {
        graph
            .nodes()
            .iter()
            .map(|n| (n.stage.name.clone(), n.next.clone()))
            .collect()
    }

    fn all_flag_sets() -> Vec<FeatureFlags> {
        let names = ["source_separation", "vad", "diarization", "bias_correction", "scene_grouping"];
        (0..1u32 << names.len())
            .map(|bits| {
                names.iter().enumerate().fold(FeatureFlags::new(), |flags, (i, name)| {
                    flags.with(*name, bits & (1 << i) != 0)
                })
            })
            .collect()
    }

    #[test]
    fn test_full_mode_defaults() {
        let catalog = media();
        let graph = GraphBuilder::new(&catalog)
            .build(WorkflowMode::Full, &FeatureFlags::new())
            .unwrap();

        let expected: Vec<(String, Option<String>)> = [
            ("demux", Some("vad")),
            ("vad", Some("asr")),
            ("asr", Some("translation")),
            ("translation", Some("bias_correction")),
            ("bias_correction", Some("subtitle_format")),
            ("subtitle_format", Some("mux")),
            ("mux", None),
        ]
        .into_iter()
        .map(|(a, b)| (a.to_string(), b.map(str::to_string)))
        .collect();

        assert_eq!(pairs(&graph), expected);
        assert_eq!(
            graph.disabled(),
            &["source_separation", "diarization", "scene_grouping"]
        );
    }

    #[test]
    fn test_adjacent_optional_stages_disabled_independently() {
        let catalog = media();
        let builder = GraphBuilder::new(&catalog);

        let only_separation = FeatureFlags::new()
            .with("source_separation", true)
            .with("vad", false);
        let graph = builder.build(WorkflowMode::Full, &only_separation).unwrap();
        assert_eq!(graph.get("demux").unwrap().next.as_deref(), Some("source_separation"));
        assert_eq!(graph.get("source_separation").unwrap().next.as_deref(), Some("asr"));

        let neither = FeatureFlags::new()
            .with("source_separation", false)
            .with("vad", false);
        let graph = builder.build(WorkflowMode::Full, &neither).unwrap();
        assert_eq!(graph.get("demux").unwrap().next.as_deref(), Some("asr"));
    }

    #[test]
    fn test_every_mode_and_flag_combination_is_consistent() {
        let catalog = media();
        let builder = GraphBuilder::new(&catalog);

        for mode in WorkflowMode::ALL {
            for flags in all_flag_sets() {
                let graph = builder.build(mode, &flags).unwrap();
                assert!(graph.is_consistent(), "mode {mode} flags {flags:?}");
                for node in graph.nodes() {
                    if let Some(next) = &node.next {
                        assert!(graph.contains(next), "dangling next {next}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let catalog = media();
        let flags = FeatureFlags::new().with("diarization", true);
        let a = GraphBuilder::new(&catalog).build(WorkflowMode::Full, &flags).unwrap();
        let b = GraphBuilder::new(&catalog).build(WorkflowMode::Full, &flags).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_translate_only_ends_at_subtitles() {
        let catalog = media();
        let graph = GraphBuilder::new(&catalog)
            .build(WorkflowMode::TranslateOnly, &FeatureFlags::new())
            .unwrap();
        assert_eq!(graph.names(), vec!["translation", "bias_correction", "subtitle_format"]);
        assert_eq!(graph.get("subtitle_format").unwrap().next, None);
    }

    #[test]
    fn test_route_that_skips_a_scheduled_stage_is_rejected() {
        let catalog = StageCatalog::builder()
            .stage(StageDefinition::new("a", "a").with_next("b"))
            .unwrap()
            .stage(StageDefinition::new("b", "b").with_next("c").optional().gated_by("b", true))
            .unwrap()
            .stage(StageDefinition::new("c", "c"))
            .unwrap()
            .route("a", ["c"])
            .build()
            .unwrap();

        let err = GraphBuilder::new(&catalog)
            .build(WorkflowMode::Full, &FeatureFlags::new())
            .unwrap_err();
        assert!(err.message.contains("routes to 'c' but 'b'"));

        let ok = GraphBuilder::new(&catalog)
            .build(WorkflowMode::Full, &FeatureFlags::new().with("b", false))
            .unwrap();
        assert_eq!(ok.names(), vec!["a", "c"]);
    }

    #[test]
    fn test_unresolvable_successor_is_rejected() {
        let catalog = StageCatalog::builder()
            .stage(StageDefinition::new("a", "a"))
            .unwrap()
            .stage(StageDefinition::new("b", "b"))
            .unwrap()
            .build()
            .unwrap();

        let err = GraphBuilder::new(&catalog)
            .build(WorkflowMode::Full, &FeatureFlags::new())
            .unwrap_err();
        assert!(err.message.contains("no resolvable successor"));
    }

    #[test]
    fn test_all_stages_disabled_is_rejected() {
        let catalog = StageCatalog::builder()
            .stage(StageDefinition::new("a", "a").optional().gated_by("a", false))
            .unwrap()
            .build()
            .unwrap();

        assert!(GraphBuilder::new(&catalog)
            .build(WorkflowMode::Full, &FeatureFlags::new())
            .is_err());
    }
}
