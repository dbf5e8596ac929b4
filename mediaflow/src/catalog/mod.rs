//! The immutable stage catalog.
//!
//! A catalog owns every [`StageDefinition`] in canonical order, the
//! declarative successor table used to rewire around disabled stages, and
//! the stage sequence of each [`WorkflowMode`]. It is built once at startup
//! and passed explicitly to the graph builder and the driver.

use crate::core::{StageDefinition, WorkflowMode};
use crate::errors::ConfigurationError;
use std::collections::{BTreeMap, HashMap};

/// Immutable table of stage definitions.
#[derive(Debug, Clone)]
pub struct StageCatalog {
    stages: Vec<StageDefinition>,
    index: HashMap<String, usize>,
    routes: BTreeMap<String, Vec<String>>,
    modes: HashMap<WorkflowMode, Vec<String>>,
}

impl StageCatalog {
    /// Starts a new catalog builder.
    #[must_use]
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// The built-in media pipeline: demux, optional separation and voice
    /// activity detection, transcription, optional diarization,
    /// translation, optional correction and grouping, subtitle formatting
    /// and muxing.
    ///
    /// # Errors
    ///
    /// Never fails for the shipped table; the `Result` comes from the
    /// shared validation path.
    pub fn media_default() -> Result<Self, ConfigurationError> {
        Self::builder()
            .stage(
                StageDefinition::new("demux", "mediaflow-demux")
                    .with_next("source_separation")
                    .with_timeout_secs(1800)
                    .with_args(["{source_media}"])
                    .with_outputs(["audio/source.wav"]),
            )?
            .stage(
                StageDefinition::new("source_separation", "mediaflow-separate")
                    .with_next("vad")
                    .with_timeout_secs(3600)
                    .optional()
                    .accelerated()
                    .gated_by("source_separation", false)
                    .with_outputs(["audio/vocals.wav"]),
            )?
            .stage(
                StageDefinition::new("vad", "mediaflow-vad")
                    .with_next("asr")
                    .with_timeout_secs(1800)
                    .optional()
                    .accelerated()
                    .gated_by("vad", true)
                    .with_outputs(["vad/segments.json"]),
            )?
            .stage(
                StageDefinition::new("asr", "mediaflow-asr")
                    .with_next("diarization")
                    .with_timeout_secs(14_400)
                    .accelerated()
                    .with_outputs(["transcript/source.json"]),
            )?
            .stage(
                StageDefinition::new("diarization", "mediaflow-diarize")
                    .with_next("translation")
                    .with_timeout_secs(7200)
                    .optional()
                    .accelerated()
                    .device_pinned()
                    .gated_by("diarization", false)
                    .with_outputs(["transcript/speakers.json"]),
            )?
            .stage(
                StageDefinition::new("translation", "mediaflow-translate")
                    .with_next("bias_correction")
                    .with_timeout_secs(7200)
                    .accelerated()
                    .with_outputs(["transcript/target.json"]),
            )?
            .stage(
                StageDefinition::new("bias_correction", "mediaflow-correct")
                    .with_next("scene_grouping")
                    .with_timeout_secs(1800)
                    .optional()
                    .gated_by("bias_correction", true),
            )?
            .stage(
                StageDefinition::new("scene_grouping", "mediaflow-group")
                    .with_next("subtitle_format")
                    .with_timeout_secs(1800)
                    .optional()
                    .gated_by("scene_grouping", false)
                    .with_outputs(["transcript/scenes.json"]),
            )?
            .stage(
                StageDefinition::new("subtitle_format", "mediaflow-subtitles")
                    .with_next("mux")
                    .with_timeout_secs(900)
                    .with_outputs(["subtitles/output.srt"]),
            )?
            .stage(
                StageDefinition::new("mux", "mediaflow-mux")
                    .with_timeout_secs(1800)
                    .with_args(["{source_media}"])
                    .with_outputs(["final/output.mkv"]),
            )?
            // Separation and VAD are both optional and both feed ASR: each
            // must route through whichever of the pair is still enabled.
            .route("demux", ["source_separation", "vad", "asr"])
            .route("source_separation", ["vad", "asr"])
            .route("vad", ["asr"])
            // Diarization output goes to translation or grouping, never to
            // the correction pass directly.
            .route("diarization", ["translation", "scene_grouping", "subtitle_format"])
            .route("scene_grouping", ["subtitle_format"])
            .mode(
                WorkflowMode::TranscribeOnly,
                [
                    "demux",
                    "source_separation",
                    "vad",
                    "asr",
                    "diarization",
                    "scene_grouping",
                    "subtitle_format",
                    "mux",
                ],
            )
            .mode(
                WorkflowMode::TranslateOnly,
                ["translation", "bias_correction", "subtitle_format"],
            )
            .mode(WorkflowMode::SubtitleOnly, ["subtitle_format", "mux"])
            .build()
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&StageDefinition> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Position of a stage in canonical order.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// All stages in canonical order.
    #[must_use]
    pub fn stages(&self) -> &[StageDefinition] {
        &self.stages
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the catalog has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Explicit successor candidates for a stage, if any are declared.
    #[must_use]
    pub fn route(&self, name: &str) -> Option<&[String]> {
        self.routes.get(name).map(Vec::as_slice)
    }

    /// Stages of a workflow mode, in canonical order.
    pub fn mode_sequence(&self, mode: WorkflowMode) -> impl Iterator<Item = &StageDefinition> {
        let names = self.modes.get(&mode);
        self.stages
            .iter()
            .filter(move |s| names.map_or(true, |n| n.contains(&s.name)))
    }
}

/// Builder for a validated [`StageCatalog`].
#[derive(Debug, Clone, Default)]
pub struct CatalogBuilder {
    stages: Vec<StageDefinition>,
    routes: BTreeMap<String, Vec<String>>,
    modes: HashMap<WorkflowMode, Vec<String>>,
}

impl CatalogBuilder {
    /// Appends a stage in canonical order.
    ///
    /// # Errors
    ///
    /// Returns an error if a stage with the same name already exists.
    pub fn stage(mut self, stage: StageDefinition) -> Result<Self, ConfigurationError> {
        if self.stages.iter().any(|s| s.name == stage.name) {
            return Err(ConfigurationError::new(format!(
                "duplicate stage '{}' in catalog",
                stage.name
            ))
            .with_stages([stage.name]));
        }
        self.stages.push(stage);
        Ok(self)
    }

    /// Declares the ordered successor candidates of a stage.
    #[must_use]
    pub fn route(
        mut self,
        from: impl Into<String>,
        candidates: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.routes
            .insert(from.into(), candidates.into_iter().map(Into::into).collect());
        self
    }

    /// Restricts a workflow mode to the named stages. Modes without an
    /// entry run the whole catalog.
    #[must_use]
    pub fn mode(
        mut self,
        mode: WorkflowMode,
        stages: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.modes
            .insert(mode, stages.into_iter().map(Into::into).collect());
        self
    }

    /// Validates and freezes the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog is empty, a `canonical_next` or
    /// route target is unknown or does not point forward in canonical
    /// order, or a mode names an unknown stage.
    pub fn build(self) -> Result<StageCatalog, ConfigurationError> {
        if self.stages.is_empty() {
            return Err(ConfigurationError::new("stage catalog is empty"));
        }

        let index: HashMap<String, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let forward = |from: &str, to: &str, what: &str| -> Result<(), ConfigurationError> {
            let (Some(&f), Some(&t)) = (index.get(from), index.get(to)) else {
                return Err(ConfigurationError::new(format!(
                    "{what} '{from}' -> '{to}' references an unknown stage"
                ))
                .with_stages([from, to]));
            };
            if t <= f {
                return Err(ConfigurationError::new(format!(
                    "{what} '{from}' -> '{to}' points backwards and would form a cycle"
                ))
                .with_stages([from, to])
                .with_fix_hint("Successors must come later in canonical order."));
            }
            Ok(())
        };

        for stage in &self.stages {
            if let Some(next) = &stage.canonical_next {
                forward(stage.name.as_str(), next.as_str(), "canonical next")?;
            }
        }
        for (from, candidates) in &self.routes {
            if !index.contains_key(from) {
                return Err(ConfigurationError::new(format!(
                    "route declared for unknown stage '{from}'"
                ))
                .with_stages([from.as_str()]));
            }
            for to in candidates {
                forward(from.as_str(), to.as_str(), "route")?;
            }
        }
        for (mode, names) in &self.modes {
            if let Some(unknown) = names.iter().find(|n| !index.contains_key(*n)) {
                return Err(ConfigurationError::new(format!(
                    "workflow mode '{mode}' names unknown stage '{unknown}'"
                ))
                .with_stages([unknown.as_str()]));
            }
        }

        Ok(StageCatalog {
            stages: self.stages,
            index,
            routes: self.routes,
            modes: self.modes,
        })
    }
}
