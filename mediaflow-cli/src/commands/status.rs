use std::fmt::Write as _;
use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};

use mediaflow::config::OrchestratorConfig;
use mediaflow::manifest::Manifest;

/// Execute the `status` command: print the stored manifest of a job.
pub fn execute(config_path: Option<&Path>, job: &str) -> Result<ExitCode> {
    let config = OrchestratorConfig::load(config_path).context("Failed to load configuration")?;
    let layout = config.layout(job)?;

    if !layout.job_dir().is_dir() {
        bail!("Unknown job '{job}': {} does not exist", layout.job_dir().display());
    }
    let path = layout.manifest_path();
    if !path.exists() {
        bail!("Job '{job}' has no manifest yet; run it first");
    }

    let manifest = Manifest::read(&path)
        .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
    print!("{}", render(&manifest));
    Ok(ExitCode::SUCCESS)
}

/// Formats a manifest summary. Stages follow the stored graph order; stages
/// outside the graph (disabled ones) come last.
pub fn render(manifest: &Manifest) -> String {
    let pipeline = &manifest.pipeline;
    let mut out = String::new();
    let _ = writeln!(out, "Job '{}': {}", manifest.job_id, pipeline.status);
    if let Some(run_id) = pipeline.run_id {
        let _ = writeln!(out, "  Last run:  {run_id}");
    }
    if let Some(finished) = pipeline.finished_at {
        let _ = writeln!(out, "  Finished:  {}", finished.to_rfc3339());
    }
    let _ = writeln!(out, "  Completed: {}", pipeline.completed_stages.join(", "));
    if !pipeline.failed_stages.is_empty() {
        let _ = writeln!(out, "  Failed:    {}", pipeline.failed_stages.join(", "));
    }

    let mut order: Vec<&str> = pipeline
        .graph
        .as_ref()
        .map(|g| g.stages.iter().map(String::as_str).collect())
        .unwrap_or_default();
    for name in manifest.stages.keys() {
        if !order.contains(&name.as_str()) {
            order.push(name);
        }
    }

    for name in order {
        let Some(record) = manifest.stages.get(name) else {
            let _ = writeln!(out, "  {name:<18} pending");
            continue;
        };
        let device = record.device.map_or_else(|| "-".to_string(), |d| d.to_string());
        let _ = write!(
            out,
            "  {name:<18} {:<10} attempts={} device={device} duration={:.1}s",
            record.status.to_string(),
            record.attempts,
            record.duration,
        );
        if let Some(error) = &record.error {
            let _ = write!(out, " error={error}");
        }
        out.push('\n');
    }
    out
}
