//! Error types for the mediaflow orchestrator.
//!
//! Configuration and job errors are fatal and raised before any stage
//! runs. [`StageError`] describes why a single stage attempt failed; the
//! driver handles those locally and never propagates them as `Err`.

use crate::core::{CrashSignal, StageStatus};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// The main error type for mediaflow operations.
#[derive(Debug, Error)]
pub enum MediaflowError {
    /// The stage graph or orchestrator configuration is unusable.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The requested job does not exist.
    #[error("{0}")]
    MissingJob(#[from] MissingJobError),

    /// The manifest file exists but cannot be used.
    #[error("Manifest error at {path}: {message}")]
    Manifest {
        /// Manifest location.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MediaflowError {
    /// Creates a manifest error.
    #[must_use]
    pub fn manifest(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Manifest {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Error raised when a stage graph cannot be built or a setting is invalid.
///
/// Always raised before any stage executes and before a manifest exists.
#[derive(Debug, Clone, Error)]
#[error("Configuration error: {message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            fix_hint: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stages = stages.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when a job id has no descriptor on disk.
#[derive(Debug, Clone, Error)]
#[error("Unknown job '{job_id}': no descriptor at {}", path.display())]
pub struct MissingJobError {
    /// The requested job id.
    pub job_id: String,
    /// Where the descriptor was expected.
    pub path: PathBuf,
}

impl MissingJobError {
    /// Creates a new missing job error.
    #[must_use]
    pub fn new(job_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            job_id: job_id.into(),
            path: path.into(),
        }
    }
}

/// Why a single stage attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageError {
    /// The process outlived its wall-clock deadline.
    #[error("stage timed out after {timeout_secs}s")]
    Timeout {
        /// The deadline that was exceeded.
        timeout_secs: u64,
    },

    /// The process was terminated by a signal.
    #[error("stage crashed with {signal}")]
    Crash {
        /// The terminating signal.
        signal: CrashSignal,
    },

    /// The process exited with a non-zero code.
    #[error("stage exited with code {exit_code}")]
    Failure {
        /// The exit code.
        exit_code: i32,
    },

    /// The process exited 0 but declared artifacts are missing.
    #[error("stage exited 0 but outputs are missing: {}", missing.join(", "))]
    OutputValidation {
        /// Missing artifact paths, relative to the output directory.
        missing: Vec<String>,
    },

    /// The process could not be started.
    #[error("failed to launch '{program}': {reason}")]
    Spawn {
        /// The program that failed to start.
        program: String,
        /// The OS error text.
        reason: String,
    },
}

impl StageError {
    /// Stable name of the error kind, used in logs and events.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "StageTimeout",
            Self::Crash { .. } => "StageCrash",
            Self::Failure { .. } => "StageFailure",
            Self::OutputValidation { .. } => "OutputValidationFailure",
            Self::Spawn { .. } => "StageSpawnFailure",
        }
    }

    /// The manifest status a terminal failure of this kind is recorded with.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        match self {
            Self::Timeout { .. } => StageStatus::Timeout,
            Self::Crash { .. } => StageStatus::Crash,
            Self::Failure { .. } | Self::OutputValidation { .. } | Self::Spawn { .. } => {
                StageStatus::Failed
            }
        }
    }

    /// Returns true if the failure looks like a resource or driver fault.
    #[must_use]
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::Crash { signal } if signal.is_resource_fault())
    }

    /// Exit code, if the process exited normally.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Failure { exit_code } => Some(*exit_code),
            _ => None,
        }
    }

    /// Terminating signal number, if the process crashed.
    #[must_use]
    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Crash { signal } => Some(signal.number()),
            _ => None,
        }
    }
}
