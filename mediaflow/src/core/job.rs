//! Job descriptors and on-disk job layout.

use super::{Device, StageFlag};
use crate::errors::{ConfigurationError, MediaflowError, MissingJobError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

/// Which slice of the full pipeline a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowMode {
    /// Every stage from demux to mux.
    #[default]
    Full,
    /// Produce subtitles in the source language.
    #[serde(alias = "transcribe")]
    TranscribeOnly,
    /// Translate an existing transcript.
    #[serde(alias = "translate")]
    TranslateOnly,
    /// Re-format and mux existing subtitles.
    #[serde(alias = "subtitle")]
    SubtitleOnly,
}

impl WorkflowMode {
    /// All modes, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::Full,
        Self::TranscribeOnly,
        Self::TranslateOnly,
        Self::SubtitleOnly,
    ];

    /// The kebab-case name used in job descriptors.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::TranscribeOnly => "transcribe-only",
            Self::TranslateOnly => "translate-only",
            Self::SubtitleOnly => "subtitle-only",
        }
    }
}

impl fmt::Display for WorkflowMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "transcribe-only" | "transcribe" => Ok(Self::TranscribeOnly),
            "translate-only" | "translate" => Ok(Self::TranslateOnly),
            "subtitle-only" | "subtitle" => Ok(Self::SubtitleOnly),
            other => Err(format!("unknown workflow mode '{other}'")),
        }
    }
}

/// Boolean switches for optional stages, keyed by flag name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(BTreeMap<String, bool>);

impl FeatureFlags {
    /// Creates an empty flag set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a flag.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, enabled: bool) -> Self {
        self.0.insert(name.into(), enabled);
        self
    }

    /// Returns whether a gated stage is enabled, falling back to its default.
    #[must_use]
    pub fn is_enabled(&self, flag: &StageFlag) -> bool {
        self.0.get(&flag.name).copied().unwrap_or(flag.default_enabled)
    }

    /// Iterates over explicitly set flags.
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// A job as submitted. Read-only to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Unique job id.
    pub job_id: String,
    /// Media file the pipeline processes.
    pub source_media: String,
    /// Which slice of the pipeline to run.
    #[serde(default)]
    pub workflow_mode: WorkflowMode,
    /// Stage config/env file handed to every stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<PathBuf>,
    /// Optional stage switches.
    #[serde(default)]
    pub stage_flags: FeatureFlags,
    /// Requested compute device for accelerated stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    /// Extra environment variables for stage processes.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl JobDescriptor {
    /// Creates a full-mode descriptor with no flags.
    #[must_use]
    pub fn new(job_id: impl Into<String>, source_media: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            source_media: source_media.into(),
            workflow_mode: WorkflowMode::Full,
            env_file: None,
            stage_flags: FeatureFlags::new(),
            device: None,
            env: BTreeMap::new(),
        }
    }

    /// Sets the workflow mode.
    #[must_use]
    pub fn with_mode(mut self, mode: WorkflowMode) -> Self {
        self.workflow_mode = mode;
        self
    }

    /// Sets the feature flags.
    #[must_use]
    pub fn with_flags(mut self, flags: FeatureFlags) -> Self {
        self.stage_flags = flags;
        self
    }

    /// Sets the requested device.
    #[must_use]
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    /// Loads the descriptor of a job from its directory.
    ///
    /// # Errors
    ///
    /// Returns [`MissingJobError`] if no descriptor exists, and a
    /// configuration error if the stored id does not match the directory.
    pub fn load(layout: &JobLayout) -> Result<Self, MediaflowError> {
        let path = layout.descriptor_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MissingJobError::new(layout.job_id(), path).into());
            }
            Err(e) => return Err(e.into()),
        };

        let job: Self = serde_json::from_str(&raw)?;
        if job.job_id != layout.job_id() {
            return Err(ConfigurationError::new(format!(
                "descriptor at {} names job '{}' but was requested as '{}'",
                path.display(),
                job.job_id,
                layout.job_id()
            ))
            .into());
        }
        Ok(job)
    }
}

/// Filesystem layout of one job. Each job owns its directory exclusively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobLayout {
    job_id: String,
    job_dir: PathBuf,
}

impl JobLayout {
    /// Layout for `job_id` under `jobs_root`.
    #[must_use]
    pub fn new(jobs_root: impl AsRef<Path>, job_id: impl Into<String>) -> Self {
        let job_id = job_id.into();
        let job_dir = jobs_root.as_ref().join(&job_id);
        Self { job_id, job_dir }
    }

    /// Layout for a job id that came from outside, such as the command
    /// line. The id must name a single directory directly under `jobs_root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty, contains a path separator or is
    /// a relative path component like `..`.
    pub fn for_job(jobs_root: impl AsRef<Path>, job_id: &str) -> Result<Self, ConfigurationError> {
        let mut components = Path::new(job_id).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(name)), None) if name == job_id
        );
        if !single || job_id.contains(['/', '\\']) {
            return Err(ConfigurationError::new(format!("invalid job id '{job_id}'"))
                .with_fix_hint("Job ids name a directory under the jobs root and cannot contain path separators or '..'"));
        }
        Ok(Self::new(jobs_root, job_id))
    }

    /// The job id.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The job's private directory.
    #[must_use]
    pub fn job_dir(&self) -> &Path {
        &self.job_dir
    }

    /// `job.json`.
    #[must_use]
    pub fn descriptor_path(&self) -> PathBuf {
        self.job_dir.join("job.json")
    }

    /// `manifest.json`, adjacent to the output directory.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.job_dir.join("manifest.json")
    }

    /// Where stages write their artifacts.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.job_dir.join("output")
    }

    /// Where per-stage logs go.
    #[must_use]
    pub fn log_root(&self) -> PathBuf {
        self.job_dir.join("logs")
    }

    /// The env file handed to stages: the descriptor's, resolved against
    /// the job directory, or `job.env` by default.
    #[must_use]
    pub fn env_file(&self, job: &JobDescriptor) -> PathBuf {
        match &job.env_file {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.job_dir.join(p),
            None => self.job_dir.join("job.env"),
        }
    }
}
