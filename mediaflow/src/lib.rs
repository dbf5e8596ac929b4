//! # Mediaflow
//!
//! A resumable orchestration engine for media-processing pipelines made of
//! external stage programs.
//!
//! Mediaflow drives a job through an ordered sequence of stages with
//! support for:
//!
//! - **Dynamic stage graphs**: optional stages are switched by per-job
//!   flags and their neighbours are rewired around them
//! - **Resumable runs**: a durable per-job manifest records every stage
//!   outcome so re-runs skip completed work
//! - **Execution strategy**: native or containerized execution, on an
//!   accelerated device or the CPU
//! - **Failure policy**: bounded retries, one-shot CPU fallback after
//!   device faults, and critical versus optional stages
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mediaflow::prelude::*;
//!
//! let config = OrchestratorConfig::load(None)?;
//! let orchestrator = Orchestrator::from_config(config)?;
//!
//! let report = orchestrator.run_job("job-42", &RunOptions::new()).await?;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod catalog;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod manifest;
pub mod pipeline;
pub mod strategy;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::catalog::StageCatalog;
    pub use crate::config::OrchestratorConfig;
    pub use crate::core::{
        Device, ExecutionMode, FeatureFlags, JobDescriptor, JobLayout, PipelineStatus,
        StageDefinition, StageStatus, WorkflowMode,
    };
    pub use crate::errors::{ConfigurationError, MediaflowError, MissingJobError, StageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{StageExecutor, StageRunner};
    pub use crate::manifest::{Manifest, ManifestStore};
    pub use crate::pipeline::{GraphBuilder, Orchestrator, PipelineReport, RunOptions, StageGraph};
    pub use crate::strategy::{ExecutionStrategySelector, SystemProbe};
}
