use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};

use mediaflow::config::OrchestratorConfig;
use mediaflow::events::LoggingEventSink;
use mediaflow::pipeline::{Orchestrator, PipelineReport, RunOptions};

/// Execute the `run` command: build the orchestrator and run one job.
pub async fn execute(
    config_path: Option<&Path>,
    job: &str,
    stages: Vec<String>,
    no_resume: bool,
) -> Result<ExitCode> {
    let config = OrchestratorConfig::load(config_path).context("Failed to load configuration")?;
    let orchestrator = Orchestrator::from_config(config)
        .context("Failed to initialise orchestrator")?
        .with_event_sink(Arc::new(LoggingEventSink::default()));

    let mut options = RunOptions::new().with_resume(!no_resume);
    if !stages.is_empty() {
        options = options.with_stages(stages);
    }

    let report = orchestrator
        .run_job(job, &options)
        .await
        .with_context(|| format!("Failed to run job '{job}'"))?;

    print!("{}", render(&report));
    Ok(super::exit_code(report.exit_code()))
}

/// Formats the end-of-run summary.
pub fn render(report: &PipelineReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Job '{}' ({}): {}", report.job_id, report.run_id, report.status);
    let _ = writeln!(out, "  Total stages:     {}", report.total_stages);
    let _ = writeln!(out, "  Completed stages: {}", report.completed_stages);
    if !report.skipped.is_empty() {
        let _ = writeln!(out, "  Skipped:          {}", report.skipped.join(", "));
    }
    if !report.failed_stages.is_empty() {
        let _ = writeln!(out, "  Failed stages:    {}", report.failed_stages.join(", "));
    }
    let _ = writeln!(out, "  Exit status:      {}", report.exit_code());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow::core::PipelineStatus;

    fn report() -> PipelineReport {
        PipelineReport {
            job_id: "job-1".into(),
            run_id: Default::default(),
            status: PipelineStatus::Failed,
            total_stages: 7,
            completed_stages: 3,
            executed: vec!["asr".into()],
            skipped: vec!["demux".into(), "vad".into()],
            failed_stages: vec!["asr".into()],
        }
    }

    #[test]
    fn test_render_failed_report() {
        let text = render(&report());
        assert!(text.contains("failed"));
        assert!(text.contains("Total stages:     7"));
        assert!(text.contains("Completed stages: 3"));
        assert!(text.contains("Failed stages:    asr"));
        assert!(text.contains("Exit status:      1"));
    }

    #[test]
    fn test_render_completed_report_omits_empty_lists() {
        let report = PipelineReport {
            status: PipelineStatus::Completed,
            skipped: Vec::new(),
            failed_stages: Vec::new(),
            ..report()
        };
        let text = render(&report);
        assert!(!text.contains("Failed stages"));
        assert!(!text.contains("Skipped"));
        assert!(text.contains("Exit status:      0"));
    }

    #[tokio::test]
    async fn test_missing_job_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        let jobs = dir.path().join("jobs");
        std::fs::write(
            &config_path,
            serde_json::json!({ "jobs_root": jobs }).to_string(),
        )
        .unwrap();

        let err = execute(Some(&config_path), "ghost", Vec::new(), false)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("ghost"));
    }

    #[tokio::test]
    async fn test_job_id_outside_jobs_root_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            serde_json::json!({ "jobs_root": dir.path().join("jobs") }).to_string(),
        )
        .unwrap();

        let err = execute(Some(&config_path), "../outside", Vec::new(), false)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid job id"));
        assert!(!dir.path().join("outside").exists());
    }
}
