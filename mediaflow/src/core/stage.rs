//! Stage definitions and per-attempt execution types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Compute resources a stage needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// CPU-only work (demuxing, formatting).
    #[default]
    None,
    /// Benefits from an accelerated device (ML inference).
    Accelerated,
}

impl fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Accelerated => write!(f, "accelerated"),
        }
    }
}

/// A compute device a stage can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    /// Plain CPU.
    Cpu,
    /// NVIDIA GPU.
    Cuda,
    /// Apple Metal Performance Shaders.
    Mps,
}

impl Device {
    /// Returns true for any non-CPU device.
    #[must_use]
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Returns the lowercase device name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
            Self::Mps => "mps",
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Device {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            other => Err(format!("unknown device '{other}'")),
        }
    }
}

/// Where a stage process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Directly against the locally installed runtime.
    Native,
    /// Inside an isolated container.
    Container,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// One stage-run: where it runs, on which device, and which try it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionAttempt {
    /// Native or containerized.
    pub mode: ExecutionMode,
    /// Compute device.
    pub device: Device,
    /// 1-based attempt counter.
    pub attempt_number: u32,
}

/// A feature flag gating an optional stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFlag {
    /// Flag name as it appears in the job's `stage_flags`.
    pub name: String,
    /// Value used when the job does not mention the flag.
    pub default_enabled: bool,
}

/// Immutable definition of a pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Unique stage name.
    pub name: String,
    /// Stage that follows in the canonical full pipeline; `None` is terminal.
    pub canonical_next: Option<String>,
    /// Wall-clock deadline in seconds.
    pub timeout_secs: u64,
    /// A critical stage's terminal failure aborts the pipeline.
    pub critical: bool,
    /// Compute resources the stage needs.
    pub resource_class: ResourceClass,
    /// External executable implementing the stage.
    pub program: String,
    /// Positional argument templates.
    #[serde(default)]
    pub args: Vec<String>,
    /// Artifacts the stage must leave in the output directory.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Feature flag gating the stage, if it is optional.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<StageFlag>,
    /// Tuned for a single device; never demoted to CPU.
    #[serde(default)]
    pub device_pinned: bool,
}

impl StageDefinition {
    /// Creates a critical, CPU-only, terminal stage with a one hour timeout.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            canonical_next: None,
            timeout_secs: 3600,
            critical: true,
            resource_class: ResourceClass::None,
            program: program.into(),
            args: Vec::new(),
            outputs: Vec::new(),
            flag: None,
            device_pinned: false,
        }
    }

    /// Sets the canonical next stage.
    #[must_use]
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.canonical_next = Some(next.into());
        self
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Marks the stage as optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Marks the stage as needing an accelerated device.
    #[must_use]
    pub fn accelerated(mut self) -> Self {
        self.resource_class = ResourceClass::Accelerated;
        self
    }

    /// Sets the positional argument templates.
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the declared output artifacts.
    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Gates the stage behind a feature flag.
    #[must_use]
    pub fn gated_by(mut self, flag: impl Into<String>, default_enabled: bool) -> Self {
        self.flag = Some(StageFlag {
            name: flag.into(),
            default_enabled,
        });
        self
    }

    /// Exempts the stage from CPU fallback.
    #[must_use]
    pub fn device_pinned(mut self) -> Self {
        self.device_pinned = true;
        self
    }

    /// Returns the timeout as a `Duration`.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns true if the stage runs on an accelerated device when available.
    #[must_use]
    pub fn is_accelerated(&self) -> bool {
        self.resource_class == ResourceClass::Accelerated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_definition_builder() {
        let stage = StageDefinition::new("asr", "mediaflow-asr")
            .with_next("diarization")
            .with_timeout_secs(7200)
            .accelerated()
            .with_outputs(["transcript.json"]);

        assert_eq!(stage.canonical_next.as_deref(), Some("diarization"));
        assert_eq!(stage.timeout(), Duration::from_secs(7200));
        assert!(stage.critical);
        assert!(stage.is_accelerated());
        assert_eq!(stage.outputs, vec!["transcript.json".to_string()]);
    }

    #[test]
    fn test_optional_gated_stage() {
        let stage = StageDefinition::new("vad", "mediaflow-vad")
            .optional()
            .gated_by("vad", true);

        assert!(!stage.critical);
        assert_eq!(stage.flag.as_ref().map(|f| f.name.as_str()), Some("vad"));
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("CUDA".parse::<Device>(), Ok(Device::Cuda));
        assert_eq!("gpu".parse::<Device>(), Ok(Device::Cuda));
        assert_eq!(" cpu ".parse::<Device>(), Ok(Device::Cpu));
        assert!("tpu".parse::<Device>().is_err());
        assert!(Device::Mps.is_accelerated());
        assert!(!Device::Cpu.is_accelerated());
    }

    #[test]
    fn test_serde_names() {
        assert_eq!(serde_json::to_string(&Device::Cuda).unwrap(), r#""cuda""#);
        assert_eq!(
            serde_json::to_string(&ExecutionMode::Container).unwrap(),
            r#""container""#
        );
        assert_eq!(
            serde_json::to_string(&ResourceClass::Accelerated).unwrap(),
            r#""accelerated""#
        );
    }
}
