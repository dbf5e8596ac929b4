//! Scripted collaborators for driving the orchestrator without processes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;

use crate::core::{CrashSignal, ExecutionAttempt};
use crate::errors::StageError;
use crate::executor::{CommandSpec, ExecutionOutcome, ExecutionRequest, StageRunner};
use crate::strategy::{HostPlatform, RuntimeProbe};

/// One scripted attempt result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    result: Result<(), StageError>,
    write_outputs: bool,
    stdout: Vec<String>,
}

impl Step {
    /// Exit 0 and create the stage's declared outputs.
    #[must_use]
    pub fn succeed() -> Self {
        Self {
            result: Ok(()),
            write_outputs: true,
            stdout: Vec::new(),
        }
    }

    /// Exit 0 without creating any output.
    #[must_use]
    pub fn succeed_without_outputs() -> Self {
        Self {
            write_outputs: false,
            ..Self::succeed()
        }
    }

    /// Exit with a non-zero code.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self::fail(StageError::Failure { exit_code: code })
    }

    /// Terminated by a signal.
    #[must_use]
    pub fn crash(signal: i32) -> Self {
        Self::fail(StageError::Crash {
            signal: CrashSignal::from(signal),
        })
    }

    /// Killed at the deadline.
    #[must_use]
    pub fn timeout(timeout_secs: u64) -> Self {
        Self::fail(StageError::Timeout { timeout_secs })
    }

    /// Any stage error.
    #[must_use]
    pub fn fail(error: StageError) -> Self {
        Self {
            result: Err(error),
            write_outputs: false,
            stdout: Vec::new(),
        }
    }

    /// Output lines reported in the tail.
    #[must_use]
    pub fn with_stdout(mut self, lines: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.stdout = lines.into_iter().map(Into::into).collect();
        self
    }
}

/// A call the scripted runner received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Stage name.
    pub stage: String,
    /// Mode, device and attempt number.
    pub attempt: ExecutionAttempt,
    /// The command that would have been spawned.
    pub command: CommandSpec,
}

/// A [`StageRunner`] that replays per-stage queues of [`Step`]s and
/// records every call. Stages without a queued step succeed.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedRunner {
    /// Creates a runner where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues steps for a stage, consumed one per attempt.
    #[must_use]
    pub fn script(self, stage: impl Into<String>, steps: impl IntoIterator<Item = Step>) -> Self {
        self.scripts
            .lock()
            .entry(stage.into())
            .or_default()
            .extend(steps);
        self
    }

    /// Queues the same step `times` times.
    #[must_use]
    pub fn always(self, stage: impl Into<String>, step: &Step, times: usize) -> Self {
        self.script(stage, std::iter::repeat(step.clone()).take(times))
    }

    /// All recorded calls in order.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Calls for one stage.
    #[must_use]
    pub fn calls_for(&self, stage: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.stage == stage)
            .cloned()
            .collect()
    }

    /// How often a stage was invoked.
    #[must_use]
    pub fn call_count(&self, stage: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.stage == stage).count()
    }

    /// Stage names in invocation order.
    #[must_use]
    pub fn invoked(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.stage.clone()).collect()
    }

    /// Clears recorded calls.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    fn output_dir(command: &CommandSpec) -> Option<PathBuf> {
        let pos = command.args.iter().position(|a| a == "--output-dir")?;
        command.args.get(pos + 1).map(PathBuf::from)
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome {
        self.calls.lock().push(RecordedCall {
            stage: request.stage.name.clone(),
            attempt: request.attempt,
            command: request.command.clone(),
        });

        let step = self
            .scripts
            .lock()
            .get_mut(&request.stage.name)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(Step::succeed);

        if step.write_outputs {
            if let Some(dir) = Self::output_dir(&request.command) {
                for output in &request.stage.outputs {
                    let path = dir.join(output);
                    if let Some(parent) = path.parent() {
                        let _ = std::fs::create_dir_all(parent);
                    }
                    let _ = std::fs::write(&path, b"");
                }
            }
        }

        let duration = Duration::from_millis(1);
        let outcome = match step.result {
            Ok(()) => ExecutionOutcome::success(duration),
            Err(e) => ExecutionOutcome::failure(e, duration),
        };
        outcome.with_tails(step.stdout, Vec::new())
    }
}

/// A [`RuntimeProbe`] with fixed answers.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe {
    /// Reported native runtime availability.
    pub native: bool,
    /// Reported platform.
    pub platform: HostPlatform,
}

impl StaticProbe {
    /// Native runtime available on Linux.
    #[must_use]
    pub fn native_linux() -> Self {
        Self {
            native: true,
            platform: HostPlatform::Linux,
        }
    }

    /// No native runtime, on Linux.
    #[must_use]
    pub fn container_linux() -> Self {
        Self {
            native: false,
            platform: HostPlatform::Linux,
        }
    }
}

impl RuntimeProbe for StaticProbe {
    fn native_available(&self) -> bool {
        self.native
    }

    fn platform(&self) -> HostPlatform {
        self.platform
    }
}
