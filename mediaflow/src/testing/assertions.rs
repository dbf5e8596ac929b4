//! Assertions over manifests.

use crate::core::{Device, StageStatus};
use crate::manifest::{Manifest, StageRecord};

fn record<'a>(manifest: &'a Manifest, stage: &str) -> &'a StageRecord {
    manifest.stages.get(stage).unwrap_or_else(|| {
        panic!(
            "no manifest record for stage '{stage}'; recorded: {:?}",
            manifest.stages.keys().collect::<Vec<_>>()
        )
    })
}

/// Asserts a stage's recorded status.
pub fn assert_stage_status(manifest: &Manifest, stage: &str, expected: StageStatus) {
    let actual = record(manifest, stage).status;
    assert_eq!(
        actual, expected,
        "stage '{stage}': expected status {expected}, got {actual}"
    );
}

/// Asserts a stage's recorded device and attempt count.
pub fn assert_stage_attempt(manifest: &Manifest, stage: &str, device: Device, attempts: u32) {
    let rec = record(manifest, stage);
    assert_eq!(rec.device, Some(device), "stage '{stage}': device");
    assert_eq!(rec.attempts, attempts, "stage '{stage}': attempts");
}

/// Asserts the exact completed stage list.
pub fn assert_completed(manifest: &Manifest, expected: &[&str]) {
    assert_eq!(
        manifest.pipeline.completed_stages, expected,
        "completed stages"
    );
}
