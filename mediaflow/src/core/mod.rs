//! Core domain model types for mediaflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Stage and pipeline status enums
//! - Stage definitions, devices and execution modes
//! - Job descriptors and the on-disk job layout
//! - Crash signal classification

mod job;
mod signal;
mod stage;
mod status;

pub use job::{FeatureFlags, JobDescriptor, JobLayout, WorkflowMode};
pub use signal::CrashSignal;
pub use stage::{
    Device, ExecutionAttempt, ExecutionMode, ResourceClass, StageDefinition, StageFlag,
};
pub use status::{PipelineStatus, StageStatus};
