//! The orchestrator driver.
//!
//! Builds the stage graph, opens the manifest, then walks the graph in
//! order: skip stages that already completed or are disabled, run the rest
//! through the strategy selector and the stage runner, and apply the
//! attempt policy to failures. A critical stage's terminal failure stops
//! the walk; an optional stage's is logged and the walk continues.

use super::{AttemptDecision, AttemptPolicy, GraphBuilder, GraphNode};
use crate::catalog::StageCatalog;
use crate::config::OrchestratorConfig;
use crate::core::{JobDescriptor, JobLayout, PipelineStatus};
use crate::errors::{MediaflowError, StageError};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::executor::{
    CommandSpec, ExecutionRequest, StageEnvironment, StageExecutor, StageRunner,
};
use crate::manifest::{ManifestStore, StageRecord};
use crate::strategy::{ExecutionStrategySelector, SystemProbe};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-invocation options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Skip stages the manifest records as completed.
    pub resume: bool,
    /// Run only these stages, in graph order. Selected stages run even if
    /// they completed before.
    pub stages: Option<Vec<String>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            resume: true,
            stages: None,
        }
    }
}

impl RunOptions {
    /// Resume with no stage selection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to resume.
    #[must_use]
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Restricts the run to the named stages.
    #[must_use]
    pub fn with_stages(mut self, stages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stages = Some(stages.into_iter().map(Into::into).collect());
        self
    }

    fn selects(&self, name: &str) -> bool {
        self.stages
            .as_ref()
            .map_or(true, |s| s.iter().any(|n| n == name))
    }
}

/// What a run did, for the user-visible summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// The job.
    pub job_id: String,
    /// Id of this invocation.
    pub run_id: Uuid,
    /// Final pipeline status.
    pub status: PipelineStatus,
    /// Stages scheduled in the graph.
    pub total_stages: usize,
    /// Graph stages the manifest records as completed after the run.
    pub completed_stages: usize,
    /// Stages executed by this invocation, in order.
    pub executed: Vec<String>,
    /// Stages skipped by this invocation.
    pub skipped: Vec<String>,
    /// Stages that failed terminally in this invocation.
    pub failed_stages: Vec<String>,
}

impl PipelineReport {
    /// Process exit code: 1 if the pipeline failed, 0 if it completed or
    /// a partial run left it open without failures.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.status {
            PipelineStatus::Running if self.failed_stages.is_empty() => 0,
            status => status.exit_code(),
        }
    }
}

/// Drives jobs through the stage graph.
pub struct Orchestrator {
    catalog: Arc<StageCatalog>,
    config: OrchestratorConfig,
    selector: ExecutionStrategySelector,
    runner: Arc<dyn StageRunner>,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.catalog.len())
            .field("jobs_root", &self.config.jobs_root)
            .field("selector", &self.selector)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator from explicit collaborators.
    #[must_use]
    pub fn new(
        catalog: Arc<StageCatalog>,
        config: OrchestratorConfig,
        selector: ExecutionStrategySelector,
        runner: Arc<dyn StageRunner>,
    ) -> Self {
        Self {
            catalog,
            config,
            selector,
            runner,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Production wiring: built-in catalog, host probe and process executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog or the executor settings are invalid.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self, MediaflowError> {
        let catalog = Arc::new(StageCatalog::media_default()?);
        let selector =
            ExecutionStrategySelector::new(&SystemProbe::new(&config.runtime), &config.runtime);
        let runner = Arc::new(StageExecutor::from_config(&config.executor)?);
        Ok(Self::new(catalog, config, selector, runner))
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// The catalog in use.
    #[must_use]
    pub fn catalog(&self) -> &StageCatalog {
        &self.catalog
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Loads a job from the jobs root and runs it.
    ///
    /// # Errors
    ///
    /// See [`Self::run`]; additionally a configuration error if the job id
    /// is not a plain directory name and [`crate::errors::MissingJobError`]
    /// if the job has no descriptor.
    pub async fn run_job(
        &self,
        job_id: &str,
        options: &RunOptions,
    ) -> Result<PipelineReport, MediaflowError> {
        let layout = self.config.layout(job_id)?;
        let job = JobDescriptor::load(&layout)?;
        self.run(&job, &layout, options).await
    }

    /// Runs a job.
    ///
    /// Stage failures never surface as `Err`; they are reflected in the
    /// report and the manifest.
    ///
    /// # Errors
    ///
    /// Returns a configuration error before anything is written if the
    /// graph cannot be built or the stage selection is invalid, and an
    /// error if the manifest cannot be read or written.
    pub async fn run(
        &self,
        job: &JobDescriptor,
        layout: &JobLayout,
        options: &RunOptions,
    ) -> Result<PipelineReport, MediaflowError> {
        let graph = GraphBuilder::new(&self.catalog).build(job.workflow_mode, &job.stage_flags)?;
        if let Some(selection) = &options.stages {
            graph.validate_selection(selection)?;
        }

        let mut store =
            ManifestStore::load_or_create(layout.manifest_path(), &job.job_id, options.resume)?;
        std::fs::create_dir_all(layout.output_dir())?;
        std::fs::create_dir_all(layout.log_root())?;

        let run_id = Uuid::new_v4();
        store.begin_run(run_id, graph.snapshot())?;

        info!(
            job_id = %job.job_id,
            run_id = %run_id,
            mode = %graph.mode(),
            stages = graph.len(),
            resume = options.resume,
            "Starting pipeline"
        );
        self.events.try_emit(
            PipelineEvent::PipelineStarted,
            json!({
                "job_id": &job.job_id,
                "run_id": run_id,
                "mode": graph.mode(),
                "stages": graph.names(),
            }),
        );

        for name in graph.disabled() {
            let critical = self.catalog.get(name).map_or(false, |s| s.critical);
            store.record(name, StageRecord::skipped(critical, "disabled by stage flag"))?;
            self.skip(&job.job_id, name, "disabled");
        }

        let mut report = PipelineReport {
            job_id: job.job_id.clone(),
            run_id,
            status: PipelineStatus::Running,
            total_stages: graph.len(),
            completed_stages: 0,
            executed: Vec::new(),
            skipped: Vec::new(),
            failed_stages: Vec::new(),
        };
        let mut aborted = false;

        for node in graph.nodes() {
            let name = node.name();
            if !options.selects(name) {
                self.skip(&job.job_id, name, "not selected");
                report.skipped.push(name.to_string());
                continue;
            }
            if options.resume && options.stages.is_none() && store.is_completed(name) {
                info!(job_id = %job.job_id, stage = %name, "Stage already completed; skipping");
                self.skip(&job.job_id, name, "completed");
                report.skipped.push(name.to_string());
                continue;
            }

            report.executed.push(name.to_string());
            if self.execute_stage(node, job, layout, &mut store).await? {
                continue;
            }

            report.failed_stages.push(name.to_string());
            if node.stage.critical {
                error!(job_id = %job.job_id, stage = %name, "Critical stage failed; aborting pipeline");
                aborted = true;
                break;
            }
            warn!(job_id = %job.job_id, stage = %name, "Optional stage failed; continuing");
        }

        // A stage selection that leaves graph stages unsettled keeps the
        // pipeline open for a later run.
        let status = if aborted {
            PipelineStatus::Failed
        } else if graph.nodes().iter().all(|n| store.manifest().is_settled(n.name())) {
            PipelineStatus::Completed
        } else {
            PipelineStatus::Running
        };
        store.finalize(status)?;

        report.status = status;
        report.completed_stages = graph
            .nodes()
            .iter()
            .filter(|n| store.is_completed(n.name()))
            .count();

        let event = if aborted {
            PipelineEvent::PipelineFailed
        } else {
            PipelineEvent::PipelineCompleted
        };
        self.events.try_emit(
            event,
            json!({
                "job_id": &job.job_id,
                "run_id": run_id,
                "status": status,
                "total_stages": report.total_stages,
                "completed_stages": report.completed_stages,
                "failed_stages": &report.failed_stages,
            }),
        );
        info!(
            job_id = %job.job_id,
            status = %status,
            completed = report.completed_stages,
            total = report.total_stages,
            "Pipeline finished"
        );

        Ok(report)
    }

    fn skip(&self, job_id: &str, stage: &str, reason: &str) {
        self.events.try_emit(
            PipelineEvent::StageSkipped,
            json!({"job_id": job_id, "stage": stage, "reason": reason}),
        );
    }

    /// Runs one stage until it succeeds or its attempt policy gives up.
    /// Returns whether it succeeded.
    async fn execute_stage(
        &self,
        node: &GraphNode,
        job: &JobDescriptor,
        layout: &JobLayout,
        store: &mut ManifestStore,
    ) -> Result<bool, MediaflowError> {
        let stage = &node.stage;
        let requested = job.device.unwrap_or(self.config.default_device);
        let log_path = layout.log_root().join(format!("{}.log", stage.name));
        let output_dir = layout.output_dir();
        let mut policy = AttemptPolicy::new(&self.config.retry, stage);

        while let Some(number) = policy.begin_attempt() {
            let attempt = self
                .selector
                .select(stage, requested, policy.forced_cpu(), number);

            info!(
                job_id = %job.job_id,
                stage = %stage.name,
                attempt = number,
                max_attempts = policy.max_attempts(),
                mode = %attempt.mode,
                device = %attempt.device,
                "Running stage"
            );
            store.record(
                &stage.name,
                StageRecord::running(stage.critical, attempt.device, attempt.mode, number),
            )?;
            self.events.try_emit(
                PipelineEvent::StageStarted,
                json!({
                    "job_id": &job.job_id,
                    "stage": &stage.name,
                    "attempt": number,
                    "mode": attempt.mode,
                    "device": attempt.device,
                }),
            );

            let env = StageEnvironment {
                job_id: job.job_id.clone(),
                stage: stage.name.clone(),
                job_dir: layout.job_dir().to_path_buf(),
                output_dir: output_dir.clone(),
                log_root: layout.log_root(),
                env_file: layout.env_file(job),
                source_media: job.source_media.clone(),
                device: attempt.device,
                mode: attempt.mode,
                attempt: number,
                overrides: job.env.clone(),
            };
            let request = ExecutionRequest {
                stage: stage.clone(),
                attempt,
                command: CommandSpec::for_stage(stage, &env, &self.config.runtime),
                timeout: stage.timeout(),
                log_path: Some(log_path.clone()),
            };

            clear_outputs(&stage.outputs, &output_dir, &stage.name);
            let outcome = self.runner.run(request).await;
            let duration = outcome.duration.as_secs_f64();
            let result = outcome
                .result
                .clone()
                .and_then(|()| verify_outputs(&stage.outputs, &output_dir));

            let err = match result {
                Ok(()) => {
                    store.record(
                        &stage.name,
                        StageRecord::succeeded(
                            stage.critical,
                            duration,
                            attempt.device,
                            attempt.mode,
                            number,
                        ),
                    )?;
                    info!(job_id = %job.job_id, stage = %stage.name, duration_secs = duration, "Stage succeeded");
                    self.events.try_emit(
                        PipelineEvent::StageSucceeded,
                        json!({
                            "job_id": &job.job_id,
                            "stage": &stage.name,
                            "attempts": number,
                            "device": attempt.device,
                            "duration_secs": duration,
                        }),
                    );
                    return Ok(true);
                }
                Err(err) => err,
            };

            let decision = policy.on_failure(&err, attempt.device);
            let terminal = decision == AttemptDecision::GiveUp;
            store.record(
                &stage.name,
                StageRecord::failed(
                    stage.critical,
                    &err,
                    terminal,
                    duration,
                    attempt.device,
                    attempt.mode,
                    number,
                )
                .with_output_tail(outcome.combined_tail()),
            )?;

            match decision {
                AttemptDecision::Retry(delay) => {
                    warn!(
                        job_id = %job.job_id,
                        stage = %stage.name,
                        attempt = number,
                        error = %err,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Stage attempt failed; retrying"
                    );
                    self.emit_retry(job, &stage.name, number, &err, false);
                    tokio::time::sleep(delay).await;
                }
                AttemptDecision::FallbackToCpu => {
                    warn!(
                        job_id = %job.job_id,
                        stage = %stage.name,
                        device = %attempt.device,
                        error = %err,
                        "Resource fault on accelerated device; retrying on CPU"
                    );
                    self.emit_retry(job, &stage.name, number, &err, true);
                }
                AttemptDecision::GiveUp => {
                    if stage.critical {
                        error!(job_id = %job.job_id, stage = %stage.name, kind = err.kind(), error = %err, "Stage failed");
                    } else {
                        warn!(job_id = %job.job_id, stage = %stage.name, kind = err.kind(), error = %err, "Optional stage failed");
                    }
                    self.events.try_emit(
                        PipelineEvent::StageFailed,
                        json!({
                            "job_id": &job.job_id,
                            "stage": &stage.name,
                            "attempts": number,
                            "critical": stage.critical,
                            "error": &err,
                        }),
                    );
                    return Ok(false);
                }
            }
        }

        Ok(false)
    }

    fn emit_retry(&self, job: &JobDescriptor, stage: &str, attempt: u32, err: &StageError, fallback: bool) {
        self.events.try_emit(
            PipelineEvent::StageRetrying,
            json!({
                "job_id": &job.job_id,
                "stage": stage,
                "attempt": attempt,
                "error": err,
                "fallback_to_cpu": fallback,
            }),
        );
    }
}

/// Removes declared outputs left by earlier attempts or runs, so only what
/// the coming attempt writes is validated.
fn clear_outputs(outputs: &[String], output_dir: &Path, stage: &str) {
    for output in outputs {
        let path = output_dir.join(output);
        let removed = match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(&path),
            Ok(_) => std::fs::remove_file(&path),
            Err(_) => continue,
        };
        match removed {
            Ok(()) => debug!(stage = %stage, path = %path.display(), "Removed stale output"),
            Err(e) => warn!(stage = %stage, path = %path.display(), error = %e, "Cannot remove stale output"),
        }
    }
}

fn verify_outputs(outputs: &[String], output_dir: &Path) -> Result<(), StageError> {
    let missing: Vec<String> = outputs
        .iter()
        .filter(|o| !output_dir.join(o).exists())
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StageError::OutputValidation { missing })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_outputs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("audio")).unwrap();
        std::fs::write(dir.path().join("audio/source.wav"), b"RIFF").unwrap();

        let outputs = vec!["audio/source.wav".to_string(), "vad/segments.json".to_string()];
        assert_eq!(
            verify_outputs(&outputs, dir.path()),
            Err(StageError::OutputValidation {
                missing: vec!["vad/segments.json".to_string()]
            })
        );
        assert_eq!(verify_outputs(&outputs[..1], dir.path()), Ok(()));
    }

    #[test]
    fn test_clear_outputs_removes_only_declared_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("audio")).unwrap();
        std::fs::create_dir_all(dir.path().join("frames/0")).unwrap();
        std::fs::write(dir.path().join("audio/source.wav"), b"RIFF").unwrap();
        std::fs::write(dir.path().join("audio/keep.txt"), b"").unwrap();

        let outputs = vec!["audio/source.wav".to_string(), "frames".to_string(), "vad/none.json".to_string()];
        clear_outputs(&outputs, dir.path(), "demux");

        assert!(!dir.path().join("audio/source.wav").exists());
        assert!(!dir.path().join("frames").exists());
        assert!(dir.path().join("audio/keep.txt").exists());
    }

    #[test]
    fn test_run_options() {
        let all = RunOptions::new();
        assert!(all.resume);
        assert!(all.selects("asr"));

        let some = RunOptions::new().with_resume(false).with_stages(["asr"]);
        assert!(some.selects("asr"));
        assert!(!some.selects("mux"));
    }
}
