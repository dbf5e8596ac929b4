//! Stage and pipeline status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The status of a single stage, both as tracked by the driver and as
/// persisted in the manifest.
///
/// Transitions: `pending -> skipped`, `pending -> running -> succeeded`,
/// or `running -> retrying -> running -> ... -> failed|timeout|crash`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not been attempted in this run.
    Pending,
    /// Stage process is running.
    Running,
    /// Last attempt failed and another attempt is scheduled.
    Retrying,
    /// Stage was skipped (resume hit or disabled by a feature flag).
    Skipped,
    /// Stage exited 0 and its declared outputs were present.
    Succeeded,
    /// Stage exited non-zero or its outputs were missing.
    Failed,
    /// Stage exceeded its wall-clock deadline.
    Timeout,
    /// Stage was terminated by a signal.
    Crash,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Retrying => write!(f, "retrying"),
            Self::Skipped => write!(f, "skipped"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Timeout => write!(f, "timeout"),
            Self::Crash => write!(f, "crash"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Succeeded | Self::Failed | Self::Timeout | Self::Crash
        )
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Skipped)
    }

    /// Returns true if the status indicates a terminal failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Timeout | Self::Crash)
    }
}

/// Pipeline-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// The driver is executing stages.
    Running,
    /// Every scheduled stage was attempted without a critical failure.
    Completed,
    /// A critical stage failed terminally.
    Failed,
}

impl Default for PipelineStatus {
    fn default() -> Self {
        Self::Running
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl PipelineStatus {
    /// Process exit code for this status.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Running | Self::Failed => 1,
        }
    }
}
