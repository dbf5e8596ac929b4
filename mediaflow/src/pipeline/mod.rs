//! Pipeline building and execution.
//!
//! This module provides:
//! - The concrete stage graph and its builder
//! - The per-stage attempt policy
//! - The orchestrator driver

mod builder;
mod driver;
mod graph;
mod retry;


pub use builder::GraphBuilder;
pub use driver::{Orchestrator, PipelineReport, RunOptions};
pub use graph::{GraphNode, GraphSnapshot, StageGraph};
pub use retry::{
    AttemptDecision, AttemptPhase, AttemptPolicy, BackoffStrategy, JitterStrategy, RetryConfig,
};
