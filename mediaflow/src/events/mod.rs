//! Pipeline lifecycle events.
//!
//! The driver reports every state transition to an [`EventSink`]. Sinks
//! are passed explicitly to the orchestrator; there is no global sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The transitions the driver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineEvent {
    /// The manifest is open and the first stage is about to run.
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    /// A stage was not executed: completed earlier, disabled or unselected.
    #[serde(rename = "stage.skipped")]
    StageSkipped,
    /// A stage attempt is starting.
    #[serde(rename = "stage.started")]
    StageStarted,
    /// A stage attempt failed and another one follows.
    #[serde(rename = "stage.retrying")]
    StageRetrying,
    /// A stage succeeded and its outputs were verified.
    #[serde(rename = "stage.succeeded")]
    StageSucceeded,
    /// A stage failed terminally.
    #[serde(rename = "stage.failed")]
    StageFailed,
    /// Every stage ran without a critical failure.
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    /// A critical stage failed.
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
}

impl PipelineEvent {
    /// The dotted event name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PipelineStarted => "pipeline.started",
            Self::StageSkipped => "stage.skipped",
            Self::StageStarted => "stage.started",
            Self::StageRetrying => "stage.retrying",
            Self::StageSucceeded => "stage.succeeded",
            Self::StageFailed => "stage.failed",
            Self::PipelineCompleted => "pipeline.completed",
            Self::PipelineFailed => "pipeline.failed",
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
