//! Testing utilities for mediaflow pipelines.
//!
//! This module provides:
//! - A scripted stage runner and a fixed runtime probe
//! - Catalog and job fixtures
//! - Manifest assertions

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_completed, assert_stage_attempt, assert_stage_status};
pub use fixtures::{quick_config, write_job, CatalogFixture};
pub use mocks::{RecordedCall, ScriptedRunner, StaticProbe, Step};
