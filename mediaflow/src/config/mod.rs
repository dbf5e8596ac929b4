//! Orchestrator configuration.
//!
//! Loaded from an optional JSON file, then overridden by `MEDIAFLOW_*`
//! environment variables. Every field has a default so an empty object is
//! a valid config.

use crate::core::{Device, JobLayout};
use crate::errors::{ConfigurationError, MediaflowError};
use crate::executor::OutputFilter;
use crate::pipeline::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable overriding [`OrchestratorConfig::jobs_root`].
pub const ENV_JOBS_ROOT: &str = "MEDIAFLOW_JOBS_ROOT";
/// Environment variable overriding [`RuntimeConfig::container_runtime`].
pub const ENV_CONTAINER_RUNTIME: &str = "MEDIAFLOW_CONTAINER_RUNTIME";
/// Environment variable overriding [`RuntimeConfig::container_image`].
pub const ENV_CONTAINER_IMAGE: &str = "MEDIAFLOW_CONTAINER_IMAGE";
/// Environment variable overriding [`OrchestratorConfig::default_device`].
pub const ENV_DEVICE: &str = "MEDIAFLOW_DEVICE";

fn default_jobs_root() -> PathBuf {
    PathBuf::from("jobs")
}

fn default_device() -> Device {
    Device::Cpu
}

fn default_tail_lines() -> usize {
    50
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_noise_patterns() -> Vec<String> {
    [
        r"^\s*\d{1,3}%\|",
        r"\d+(\.\d+)?\s*(it|s)/(s|it)\]?\s*$",
        r"(?i)^\s*downloading\b",
        r"(?i)^\s*fetching \d+ files",
        r"^\s*$",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_failure_keywords() -> Vec<String> {
    [
        r"traceback \(most recent call last\)",
        r"out of memory",
        r"segmentation fault",
        r"\berror:",
        r"\bfatal\b",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_native_runtime() -> String {
    "python3".to_string()
}

fn default_container_runtime() -> String {
    "docker".to_string()
}

fn default_container_image() -> String {
    "mediaflow/stages:latest".to_string()
}

fn default_true() -> bool {
    true
}

/// Stage output handling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Trailing output lines kept for the manifest.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    /// Regexes of lines dropped before logging.
    #[serde(default = "default_noise_patterns")]
    pub noise_patterns: Vec<String>,
    /// Case-insensitive regexes of lines escalated to error severity.
    #[serde(default = "default_failure_keywords")]
    pub failure_keywords: Vec<String>,
    /// How long output readers may drain after a kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
            noise_patterns: default_noise_patterns(),
            failure_keywords: default_failure_keywords(),
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// Where and how stage programs run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Executable whose presence on `PATH` enables native execution.
    #[serde(default = "default_native_runtime")]
    pub native_runtime: String,
    /// Directory prefixed to relative stage programs in native mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_bin_dir: Option<PathBuf>,
    /// Container CLI, e.g. `docker` or `podman`.
    #[serde(default = "default_container_runtime")]
    pub container_runtime: String,
    /// Image that bundles every stage program.
    #[serde(default = "default_container_image")]
    pub container_image: String,
    /// Whether the container runtime can pass GPUs through.
    #[serde(default = "default_true")]
    pub gpu_passthrough: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            native_runtime: default_native_runtime(),
            stage_bin_dir: None,
            container_runtime: default_container_runtime(),
            container_image: default_container_image(),
            gpu_passthrough: true,
        }
    }
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Directory holding one subdirectory per job.
    #[serde(default = "default_jobs_root")]
    pub jobs_root: PathBuf,
    /// Retry budget and pacing.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Stage output handling.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Runtime selection inputs.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Device used when a job does not request one.
    #[serde(default = "default_device")]
    pub default_device: Device,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            jobs_root: default_jobs_root(),
            retry: RetryConfig::default(),
            executor: ExecutorConfig::default(),
            runtime: RuntimeConfig::default(),
            default_device: default_device(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the jobs root.
    #[must_use]
    pub fn with_jobs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.jobs_root = root.into();
        self
    }

    /// Sets the retry config.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the executor config.
    #[must_use]
    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    /// Sets the runtime config.
    #[must_use]
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    /// Sets the default device.
    #[must_use]
    pub fn with_default_device(mut self, device: Device) -> Self {
        self.default_device = device;
        self
    }

    /// Reads a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, MediaflowError> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            ConfigurationError::new(format!("invalid config file {}: {e}", path.display())).into()
        })
    }

    /// Loads the file (if any), applies process environment overrides,
    /// validates the result and anchors a relative `jobs_root` at the
    /// working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or the result is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self, MediaflowError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let mut config = config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        // Stage processes and container mounts need absolute job paths.
        if config.jobs_root.is_relative() {
            config.jobs_root = std::env::current_dir()?.join(&config.jobs_root);
        }
        Ok(config)
    }

    /// Applies `MEDIAFLOW_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns an error if `MEDIAFLOW_DEVICE` names an unknown device.
    pub fn apply_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigurationError> {
        if let Some(root) = lookup(ENV_JOBS_ROOT) {
            self.jobs_root = PathBuf::from(root);
        }
        if let Some(runtime) = lookup(ENV_CONTAINER_RUNTIME) {
            self.runtime.container_runtime = runtime;
        }
        if let Some(image) = lookup(ENV_CONTAINER_IMAGE) {
            self.runtime.container_image = image;
        }
        if let Some(device) = lookup(ENV_DEVICE) {
            self.default_device = device.parse().map_err(|e: String| {
                ConfigurationError::new(format!("{ENV_DEVICE}: {e}"))
                    .with_fix_hint("Use one of: cpu, cuda, mps.")
            })?;
        }
        Ok(self)
    }

    /// Checks that the output filter patterns compile and the runtime names
    /// are usable.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        OutputFilter::from_config(&self.executor)?;
        if self.runtime.container_runtime.trim().is_empty() {
            return Err(ConfigurationError::new("runtime.container_runtime is empty"));
        }
        if self.runtime.container_image.trim().is_empty() {
            return Err(ConfigurationError::new("runtime.container_image is empty"));
        }
        Ok(())
    }

    /// Filesystem layout of a job under [`Self::jobs_root`].
    ///
    /// # Errors
    ///
    /// Returns an error if `job_id` does not name a directory directly
    /// under the jobs root.
    pub fn layout(&self, job_id: &str) -> Result<JobLayout, ConfigurationError> {
        JobLayout::for_job(&self.jobs_root, job_id)
    }
}
