//! Durable per-job manifest used for resumable runs.
//!
//! The manifest has exactly one writer, the driver. Every mutation is
//! followed by a full rewrite of the file through a temp file and a rename,
//! so a crash at any point leaves either the previous or the new manifest
//! on disk, never a partially written stage record.

use crate::core::{Device, ExecutionMode, PipelineStatus, StageStatus};
use crate::errors::{MediaflowError, StageError};
use crate::pipeline::GraphSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// Pipeline-level section of the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineRecord {
    /// Current pipeline status.
    pub status: PipelineStatus,
    /// Stages that succeeded, in completion order.
    #[serde(default)]
    pub completed_stages: Vec<String>,
    /// Stages whose last attempt failed terminally.
    #[serde(default)]
    pub failed_stages: Vec<String>,
    /// Id of the orchestrator invocation that last wrote the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    /// When that invocation started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When that invocation finalized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// The graph variant the completed stages were produced under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphSnapshot>,
}

/// Per-stage section of the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage status after the last recorded attempt.
    pub status: StageStatus,
    /// Wall-clock seconds of the last attempt.
    pub duration: f64,
    /// Device of the last attempt.
    #[serde(default)]
    pub device: Option<Device>,
    /// Execution mode of the last attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    /// Attempts made in the run that wrote this record.
    #[serde(default)]
    pub attempts: u32,
    /// Whether the stage is critical.
    #[serde(default)]
    pub critical: bool,
    /// Exit code of a non-zero exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Terminating signal of a crash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Trailing output lines of a failed attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_tail: Vec<String>,
    /// Last time the record changed.
    pub updated_at: DateTime<Utc>,
}

impl StageRecord {
    fn base(status: StageStatus, critical: bool) -> Self {
        Self {
            status,
            duration: 0.0,
            device: None,
            mode: None,
            attempts: 0,
            critical,
            exit_code: None,
            signal: None,
            error: None,
            output_tail: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// An attempt that has started.
    #[must_use]
    pub fn running(critical: bool, device: Device, mode: ExecutionMode, attempts: u32) -> Self {
        Self {
            device: Some(device),
            mode: Some(mode),
            attempts,
            ..Self::base(StageStatus::Running, critical)
        }
    }

    /// A successful attempt.
    #[must_use]
    pub fn succeeded(critical: bool, duration: f64, device: Device, mode: ExecutionMode, attempts: u32) -> Self {
        Self {
            duration,
            device: Some(device),
            mode: Some(mode),
            attempts,
            ..Self::base(StageStatus::Succeeded, critical)
        }
    }

    /// A failed attempt; `status` is `retrying` when another attempt follows,
    /// otherwise the terminal status of the error.
    #[must_use]
    pub fn failed(
        critical: bool,
        error: &StageError,
        terminal: bool,
        duration: f64,
        device: Device,
        mode: ExecutionMode,
        attempts: u32,
    ) -> Self {
        let status = if terminal {
            error.status()
        } else {
            StageStatus::Retrying
        };
        Self {
            duration,
            device: Some(device),
            mode: Some(mode),
            attempts,
            exit_code: error.exit_code(),
            signal: error.signal(),
            error: Some(error.to_string()),
            ..Self::base(status, critical)
        }
    }

    /// A stage that was not executed.
    #[must_use]
    pub fn skipped(critical: bool, reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            ..Self::base(StageStatus::Skipped, critical)
        }
    }

    /// Attaches trailing output lines.
    #[must_use]
    pub fn with_output_tail(mut self, tail: Vec<String>) -> Self {
        self.output_tail = tail;
        self
    }
}

/// The manifest document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Job the manifest belongs to.
    pub job_id: String,
    /// Pipeline-level status.
    pub pipeline: PipelineRecord,
    /// Per-stage records keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, StageRecord>,
}

impl Manifest {
    /// Creates an empty manifest.
    #[must_use]
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            pipeline: PipelineRecord::default(),
            stages: BTreeMap::new(),
        }
    }

    /// Reads a manifest file.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read and a manifest error
    /// if it is not a valid manifest.
    pub fn read(path: &Path) -> Result<Self, MediaflowError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| MediaflowError::manifest(path, e.to_string()))
    }

    /// Returns true if the stage is in `completed_stages`.
    #[must_use]
    pub fn is_completed(&self, name: &str) -> bool {
        self.pipeline.completed_stages.iter().any(|s| s == name)
    }

    /// Returns true if the stage needs nothing more for the pipeline to
    /// count as completed: it succeeded, was skipped, or is optional and
    /// failed terminally.
    #[must_use]
    pub fn is_settled(&self, name: &str) -> bool {
        if self.is_completed(name) {
            return true;
        }
        self.stages.get(name).map_or(false, |r| {
            r.status == StageStatus::Skipped || (r.status.is_failure() && !r.critical)
        })
    }

    fn apply(&mut self, name: &str, record: StageRecord) {
        let lists = &mut self.pipeline;
        match record.status {
            StageStatus::Succeeded => {
                lists.failed_stages.retain(|s| s != name);
                if !lists.completed_stages.iter().any(|s| s == name) {
                    lists.completed_stages.push(name.to_string());
                }
            }
            // Re-running a stage voids its earlier completion.
            StageStatus::Running => lists.completed_stages.retain(|s| s != name),
            status if status.is_failure() => {
                lists.completed_stages.retain(|s| s != name);
                if !lists.failed_stages.iter().any(|s| s == name) {
                    lists.failed_stages.push(name.to_string());
                }
            }
            _ => {}
        }
        self.stages.insert(name.to_string(), record);
    }

    /// Drops completion markers that were produced under a different graph.
    ///
    /// Stages inside the longest common prefix of the stored and current
    /// stage orders saw identical upstream stages and stay completed; every
    /// completed stage after the first divergence is invalidated.
    fn reconcile(&mut self, current: &GraphSnapshot) -> Vec<String> {
        let Some(previous) = &self.pipeline.graph else {
            return Vec::new();
        };
        if previous.fingerprint == current.fingerprint {
            return Vec::new();
        }

        let keep: Vec<String> = current.stages[..previous.common_prefix_len(current)].to_vec();
        let invalidated: Vec<String> = self
            .pipeline
            .completed_stages
            .iter()
            .filter(|s| !keep.contains(s))
            .cloned()
            .collect();

        self.pipeline.completed_stages.retain(|s| keep.contains(s));
        for name in &invalidated {
            if let Some(record) = self.stages.get_mut(name) {
                record.status = StageStatus::Pending;
                record.error = Some("invalidated: stage graph changed since completion".into());
                record.updated_at = Utc::now();
            }
        }
        invalidated
    }
}

/// Owns the manifest of one job and keeps its file in sync.
#[derive(Debug)]
pub struct ManifestStore {
    path: PathBuf,
    manifest: Manifest,
}

impl ManifestStore {
    /// Loads the manifest at `path` when resuming and it exists, otherwise
    /// starts a fresh one. Nothing is written until [`Self::begin_run`].
    ///
    /// # Errors
    ///
    /// Returns an error if an existing manifest cannot be parsed or belongs
    /// to another job.
    pub fn load_or_create(
        path: impl Into<PathBuf>,
        job_id: &str,
        resume: bool,
    ) -> Result<Self, MediaflowError> {
        let path = path.into();
        let manifest = if resume && path.exists() {
            let manifest = Manifest::read(&path)?;
            if manifest.job_id != job_id {
                return Err(MediaflowError::manifest(
                    &path,
                    format!("belongs to job '{}', not '{job_id}'", manifest.job_id),
                ));
            }
            debug!(
                path = %path.display(),
                completed = manifest.pipeline.completed_stages.len(),
                "Loaded manifest for resume"
            );
            manifest
        } else {
            Manifest::new(job_id)
        };
        Ok(Self { path, manifest })
    }

    /// Marks the pipeline running for a new invocation and stores the graph
    /// snapshot. Returns the stages whose completion was invalidated
    /// because the graph changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn begin_run(
        &mut self,
        run_id: Uuid,
        snapshot: GraphSnapshot,
    ) -> Result<Vec<String>, MediaflowError> {
        let invalidated = self.manifest.reconcile(&snapshot);
        if !invalidated.is_empty() {
            warn!(
                job_id = %self.manifest.job_id,
                stages = ?invalidated,
                "Stage graph changed since last run; re-running affected stages"
            );
        }

        let pipeline = &mut self.manifest.pipeline;
        pipeline.status = PipelineStatus::Running;
        pipeline.run_id = Some(run_id);
        pipeline.started_at = Some(Utc::now());
        pipeline.finished_at = None;
        pipeline.graph = Some(snapshot);

        self.persist()?;
        Ok(invalidated)
    }

    /// Returns true if the stage completed in this or an earlier run.
    #[must_use]
    pub fn is_completed(&self, name: &str) -> bool {
        self.manifest.is_completed(name)
    }

    /// Records the outcome of a stage attempt and rewrites the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn record(&mut self, name: &str, record: StageRecord) -> Result<(), MediaflowError> {
        self.manifest.apply(name, record);
        self.persist()
    }

    /// Sets the final pipeline status and rewrites the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be written.
    pub fn finalize(&mut self, status: PipelineStatus) -> Result<(), MediaflowError> {
        self.manifest.pipeline.status = status;
        self.manifest.pipeline.finished_at = Some(Utc::now());
        self.persist()
    }

    /// The in-memory manifest.
    #[must_use]
    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// The manifest location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), MediaflowError> {
        let bytes = serde_json::to_vec_pretty(&self.manifest)?;
        atomic_write(&self.path, &bytes)
    }
}

fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), MediaflowError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent)?;
    }

    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("manifest.json");
    let tmp = path.with_file_name(format!(".{name}.tmp.{}", std::process::id()));

    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;

    if let Some(dir) = parent.and_then(|p| fs::File::open(p).ok()) {
        let _ = dir.sync_all();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn snapshot(fingerprint: &str, stages: &[&str]) -> GraphSnapshot {
        GraphSnapshot {
            fingerprint: fingerprint.into(),
            stages: stages.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    fn ok(critical: bool) -> StageRecord {
        StageRecord::succeeded(critical, 1.5, Device::Cpu, ExecutionMode::Native, 1)
    }

    #[test]
    fn test_fresh_store_writes_on_begin_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job").join("manifest.json");
        let mut store = ManifestStore::load_or_create(&path, "job", true).unwrap();
        assert!(!path.exists());

        store.begin_run(Uuid::new_v4(), snapshot("f", &["a"])).unwrap();
        let on_disk = Manifest::read(&path).unwrap();
        assert_eq!(on_disk.pipeline.status, PipelineStatus::Running);
        assert_eq!(on_disk.pipeline.graph, Some(snapshot("f", &["a"])));
    }

    #[test]
    fn test_record_updates_lists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut store = ManifestStore::load_or_create(&path, "job", false).unwrap();
        store.begin_run(Uuid::new_v4(), snapshot("f", &["a", "b"])).unwrap();

        let err = StageError::Failure { exit_code: 2 };
        store
            .record("a", StageRecord::failed(true, &err, true, 0.1, Device::Cpu, ExecutionMode::Native, 2))
            .unwrap();
        assert_eq!(store.manifest().pipeline.failed_stages, vec!["a".to_string()]);

        store.record("a", ok(true)).unwrap();
        assert!(store.is_completed("a"));
        assert!(store.manifest().pipeline.failed_stages.is_empty());

        let on_disk = Manifest::read(&path).unwrap();
        assert_eq!(on_disk.stages["a"].status, StageStatus::Succeeded);
        assert_eq!(on_disk.stages["a"].attempts, 1);
    }

    #[test]
    fn test_retrying_record_keeps_lists() {
        let mut manifest = Manifest::new("job");
        let err = StageError::Crash { signal: crate::core::CrashSignal::OutOfMemory };
        manifest.apply(
            "asr",
            StageRecord::failed(true, &err, false, 3.0, Device::Cuda, ExecutionMode::Native, 1),
        );

        assert_eq!(manifest.stages["asr"].status, StageStatus::Retrying);
        assert_eq!(manifest.stages["asr"].signal, Some(9));
        assert!(manifest.pipeline.failed_stages.is_empty());
    }

    #[test]
    fn test_resume_loads_and_no_resume_discards() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut store = ManifestStore::load_or_create(&path, "job", false).unwrap();
        store.begin_run(Uuid::new_v4(), snapshot("f", &["a"])).unwrap();
        store.record("a", ok(true)).unwrap();
        store.finalize(PipelineStatus::Completed).unwrap();

        let resumed = ManifestStore::load_or_create(&path, "job", true).unwrap();
        assert!(resumed.is_completed("a"));
        assert_eq!(resumed.manifest().pipeline.status, PipelineStatus::Completed);

        let fresh = ManifestStore::load_or_create(&path, "job", false).unwrap();
        assert!(!fresh.is_completed("a"));
    }

    #[test]
    fn test_foreign_manifest_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut store = ManifestStore::load_or_create(&path, "job-1", false).unwrap();
        store.begin_run(Uuid::new_v4(), snapshot("f", &["a"])).unwrap();

        let err = ManifestStore::load_or_create(&path, "job-2", true).unwrap_err();
        assert!(matches!(err, MediaflowError::Manifest { .. }));
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        fs::write(&path, "{not json").unwrap();
        assert!(ManifestStore::load_or_create(&path, "job", true).is_err());
    }

    #[test]
    fn test_graph_change_invalidates_after_divergence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut store = ManifestStore::load_or_create(&path, "job", false).unwrap();
        store
            .begin_run(Uuid::new_v4(), snapshot("old", &["demux", "vad", "asr", "mux"]))
            .unwrap();
        for stage in ["demux", "vad", "asr"] {
            store.record(stage, ok(true)).unwrap();
        }

        let mut resumed = ManifestStore::load_or_create(&path, "job", true).unwrap();
        let invalidated = resumed
            .begin_run(Uuid::new_v4(), snapshot("new", &["demux", "asr", "mux"]))
            .unwrap();

        assert_eq!(invalidated, vec!["vad".to_string(), "asr".to_string()]);
        assert!(resumed.is_completed("demux"));
        assert!(!resumed.is_completed("asr"));
        assert_eq!(resumed.manifest().stages["asr"].status, StageStatus::Pending);
    }

    #[test]
    fn test_same_graph_keeps_everything() {
        let mut manifest = Manifest::new("job");
        manifest.pipeline.graph = Some(snapshot("same", &["a", "b"]));
        manifest.apply("a", ok(true));
        manifest.apply("b", ok(false));

        assert!(manifest.reconcile(&snapshot("same", &["a", "b"])).is_empty());
        assert_eq!(manifest.pipeline.completed_stages.len(), 2);
    }

    #[test]
    fn test_is_settled_covers_terminal_records() {
        let mut manifest = Manifest::new("job");
        manifest.apply("a", ok(true));
        let err = StageError::Failure { exit_code: 1 };
        manifest.apply("opt", StageRecord::failed(false, &err, false, 0.1, Device::Cpu, ExecutionMode::Native, 1));
        manifest.apply("crit", StageRecord::failed(true, &err, false, 0.1, Device::Cpu, ExecutionMode::Native, 1));

        assert!(manifest.is_settled("a"));
        assert!(manifest.is_settled("opt"));
        assert!(!manifest.is_settled("crit"));
        assert!(!manifest.is_settled("never-ran"));
    }

    #[test]
    fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut store = ManifestStore::load_or_create(&path, "job", false).unwrap();
        store.begin_run(Uuid::new_v4(), snapshot("f", &["a"])).unwrap();
        store.finalize(PipelineStatus::Completed).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
