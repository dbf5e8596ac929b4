//! Fixtures for orchestrator tests.

use std::path::Path;

use crate::catalog::StageCatalog;
use crate::config::OrchestratorConfig;
use crate::core::{JobDescriptor, JobLayout, StageDefinition};
use crate::errors::{ConfigurationError, MediaflowError};
use crate::pipeline::{JitterStrategy, RetryConfig};

/// Builds small linear catalogs: each stage's canonical next is the stage
/// added after it.
#[derive(Debug, Clone, Default)]
pub struct CatalogFixture {
    stages: Vec<StageDefinition>,
}

impl CatalogFixture {
    /// Creates an empty fixture.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a fully specified stage.
    #[must_use]
    pub fn stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends a critical CPU stage.
    #[must_use]
    pub fn critical(self, name: &str) -> Self {
        self.stage(StageDefinition::new(name, format!("stage-{name}")))
    }

    /// Appends an optional CPU stage.
    #[must_use]
    pub fn optional(self, name: &str) -> Self {
        self.stage(StageDefinition::new(name, format!("stage-{name}")).optional())
    }

    /// Appends a critical accelerated stage.
    #[must_use]
    pub fn accelerated(self, name: &str) -> Self {
        self.stage(StageDefinition::new(name, format!("stage-{name}")).accelerated())
    }

    /// Links the stages in order and builds the catalog.
    ///
    /// # Errors
    ///
    /// Returns the catalog validation error, if any.
    pub fn build(self) -> Result<StageCatalog, ConfigurationError> {
        let names: Vec<String> = self.stages.iter().map(|s| s.name.clone()).collect();
        let mut builder = StageCatalog::builder();
        for (i, mut stage) in self.stages.into_iter().enumerate() {
            if stage.canonical_next.is_none() {
                stage.canonical_next = names.get(i + 1).cloned();
            }
            builder = builder.stage(stage)?;
        }
        builder.build()
    }
}

/// A config with millisecond retry delays and no jitter, rooted at
/// `jobs_root`.
#[must_use]
pub fn quick_config(jobs_root: &Path) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_jobs_root(jobs_root)
        .with_retry(
            RetryConfig::new()
                .with_base_delay_ms(1)
                .with_max_delay_ms(5)
                .with_jitter(JitterStrategy::None),
        )
}

/// Writes a job descriptor under `jobs_root` and returns its layout.
///
/// # Errors
///
/// Returns an IO or serialization error.
pub fn write_job(jobs_root: &Path, job: &JobDescriptor) -> Result<JobLayout, MediaflowError> {
    let layout = JobLayout::new(jobs_root, job.job_id.clone());
    std::fs::create_dir_all(layout.job_dir())?;
    std::fs::write(layout.descriptor_path(), serde_json::to_vec_pretty(job)?)?;
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_fixture_links_stages() {
        let catalog = CatalogFixture::new()
            .critical("a")
            .optional("b")
            .critical("c")
            .build()
            .unwrap();
        assert_eq!(catalog.get("a").unwrap().canonical_next.as_deref(), Some("b"));
        assert_eq!(catalog.get("c").unwrap().canonical_next, None);
        assert!(!catalog.get("b").unwrap().critical);
    }

    #[test]
    fn test_write_job_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let job = JobDescriptor::new("j1", "in.mkv");
        let layout = write_job(dir.path(), &job).unwrap();
        assert_eq!(JobDescriptor::load(&layout).unwrap(), job);
    }
}
