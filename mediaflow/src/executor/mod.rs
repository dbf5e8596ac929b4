//! Stage executor: launches stage programs and classifies how they end.
//!
//! [`StageRunner`] is the seam the driver calls through; [`StageExecutor`]
//! is the process-backed implementation. Stages run in their own process
//! group so a timeout stops everything they started. Output is read line by
//! line from both streams, classified by an [`OutputFilter`], kept in
//! bounded tails and appended to the stage log.

mod env;
mod output;

pub use env::{CommandSpec, StageEnvironment};
pub use output::{LineClass, OutputFilter, TailBuffer};

use crate::config::ExecutorConfig;
use crate::core::{CrashSignal, ExecutionAttempt, ExecutionMode, StageDefinition};
use crate::errors::{ConfigurationError, StageError};
use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Longest stored output line; longer lines are cut.
const MAX_LINE_LENGTH: usize = 4096;

/// How long the container runtime gets to stop a timed out container.
const CONTAINER_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for a signalled process group to exit.
#[cfg(unix)]
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lowest and highest exit codes a container runtime uses for signal deaths.
const CONTAINER_SIGNAL_BASE: i32 = 128;
const CONTAINER_SIGNAL_MAX: i32 = 159;

/// Everything needed to run one stage attempt.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The stage being run.
    pub stage: StageDefinition,
    /// Mode, device and attempt number.
    pub attempt: ExecutionAttempt,
    /// The resolved process.
    pub command: CommandSpec,
    /// Wall-clock deadline.
    pub timeout: Duration,
    /// Stage log file, appended to.
    pub log_path: Option<PathBuf>,
}

/// Result of one stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// `Ok` on exit 0; output validation is the caller's concern.
    pub result: Result<(), StageError>,
    /// Wall-clock time of the attempt.
    pub duration: Duration,
    /// Trailing stdout lines.
    pub stdout_tail: Vec<String>,
    /// Trailing stderr lines.
    pub stderr_tail: Vec<String>,
    /// Number of lines escalated to error severity.
    pub escalated_lines: usize,
}

impl ExecutionOutcome {
    /// A successful outcome with no output.
    #[must_use]
    pub fn success(duration: Duration) -> Self {
        Self {
            result: Ok(()),
            duration,
            stdout_tail: Vec::new(),
            stderr_tail: Vec::new(),
            escalated_lines: 0,
        }
    }

    /// A failed outcome with no output.
    #[must_use]
    pub fn failure(error: StageError, duration: Duration) -> Self {
        Self {
            result: Err(error),
            ..Self::success(duration)
        }
    }

    /// Attaches trailing output.
    #[must_use]
    pub fn with_tails(mut self, stdout: Vec<String>, stderr: Vec<String>) -> Self {
        self.stdout_tail = stdout;
        self.stderr_tail = stderr;
        self
    }

    /// Returns true if the process exited 0.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Stdout tail followed by the stderr tail, for the manifest.
    #[must_use]
    pub fn combined_tail(&self) -> Vec<String> {
        self.stdout_tail
            .iter()
            .cloned()
            .chain(self.stderr_tail.iter().map(|l| format!("[stderr] {l}")))
            .collect()
    }
}

/// Runs stage attempts. Implemented by [`StageExecutor`] for real
/// processes and by scripted runners in tests.
#[async_trait]
pub trait StageRunner: Send + Sync {
    /// Runs one attempt to completion, timeout or failure to launch.
    async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome;
}

/// Classifies a process exit.
///
/// `code` is the exit code when the process exited normally and `signal`
/// the terminating signal otherwise. Container runtimes report a signal
/// death of the contained process as `128 + n`.
pub fn classify_exit(code: Option<i32>, signal: Option<i32>, mode: ExecutionMode) -> Result<(), StageError> {
    match (code, signal) {
        (Some(0), _) => Ok(()),
        (_, Some(n)) => Err(StageError::Crash {
            signal: CrashSignal::from(n),
        }),
        (Some(c), None)
            if mode == ExecutionMode::Container
                && c > CONTAINER_SIGNAL_BASE
                && c <= CONTAINER_SIGNAL_MAX =>
        {
            Err(StageError::Crash {
                signal: CrashSignal::from(c - CONTAINER_SIGNAL_BASE),
            })
        }
        (Some(c), None) if c < 0 => Err(StageError::Crash {
            signal: CrashSignal::from(-c),
        }),
        (Some(c), None) => Err(StageError::Failure { exit_code: c }),
        (None, None) => Err(StageError::Failure { exit_code: -1 }),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Reads one line ending in `\n` or `\r` into `line`, keeping at most
/// `max` bytes of it. Returns `None` at end of stream, otherwise whether the
/// line was cut.
async fn read_line_bounded<R>(reader: &mut R, line: &mut Vec<u8>, max: usize) -> std::io::Result<Option<bool>>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut read_any = false;
    let mut cut = false;
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(read_any.then_some(cut));
        }
        read_any = true;

        let end = buf.iter().position(|&b| matches!(b, b'\n' | b'\r'));
        let chunk = &buf[..end.unwrap_or(buf.len())];
        let room = max.saturating_sub(line.len());
        if chunk.len() > room {
            cut = true;
        }
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);

        let used = end.map_or(buf.len(), |i| i + 1);
        reader.consume(used);
        if end.is_some() {
            return Ok(Some(cut));
        }
    }
}

/// Stops a process group: SIGTERM, up to `grace` for the leader to exit,
/// then SIGKILL for anything left in the group.
#[cfg(unix)]
async fn terminate_process_group(child: &mut AsyncGroupChild, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.inner().id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    let group = Pid::from_raw(-pid);

    if let Err(e) = signal::kill(group, Signal::SIGTERM) {
        if e != Errno::ESRCH {
            warn!(pid, error = %e, "SIGTERM to stage process group failed");
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if matches!(child.inner().try_wait(), Ok(Some(_))) {
            break;
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    // Group members can outlive the leader.
    if let Err(e) = signal::kill(group, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            warn!(pid, error = %e, "SIGKILL to stage process group failed");
        }
    }
    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut AsyncGroupChild, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}

/// Asks the container runtime to kill a timed out container. Killing the
/// runtime client alone can leave the container running.
async fn stop_container(stop: &CommandSpec, stage: &str) {
    let status = Command::new(&stop.program)
        .args(&stop.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status();
    match tokio::time::timeout(CONTAINER_STOP_TIMEOUT, status).await {
        Ok(Ok(status)) if status.success() => debug!(stage = %stage, command = %stop, "Stopped container"),
        Ok(Ok(status)) => warn!(stage = %stage, command = %stop, %status, "Container stop command failed"),
        Ok(Err(e)) => warn!(stage = %stage, command = %stop, error = %e, "Cannot run container stop command"),
        Err(_) => warn!(stage = %stage, command = %stop, "Container stop command timed out"),
    }
}

#[derive(Debug)]
struct Capture {
    stdout: TailBuffer,
    stderr: TailBuffer,
    log: Option<LineWriter<File>>,
    escalated: usize,
}

impl Capture {
    fn write_log(&mut self, line: &str) {
        if let Some(log) = self.log.as_mut() {
            if let Err(e) = writeln!(log, "{line}") {
                warn!(error = %e, "Failed to append to stage log; further lines are dropped");
                self.log = None;
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Process-backed [`StageRunner`].
#[derive(Debug, Clone)]
pub struct StageExecutor {
    filter: Arc<OutputFilter>,
    tail_lines: usize,
    kill_grace: Duration,
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(filter: OutputFilter, tail_lines: usize, kill_grace: Duration) -> Self {
        Self {
            filter: Arc::new(filter),
            tail_lines,
            kill_grace,
        }
    }

    /// Creates an executor from settings.
    ///
    /// # Errors
    ///
    /// Returns an error if an output pattern does not compile.
    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ConfigurationError> {
        Ok(Self::new(
            OutputFilter::from_config(config)?,
            config.tail_lines,
            Duration::from_millis(config.kill_grace_ms),
        ))
    }

    fn open_log(request: &ExecutionRequest) -> Option<LineWriter<File>> {
        let path = request.log_path.as_ref()?;
        let opened = path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| OpenOptions::new().create(true).append(true).open(path));
        match opened {
            Ok(file) => {
                let mut log = LineWriter::new(file);
                let header = format!(
                    "=== {} attempt {} mode={} device={} at {} ===\n$ {}",
                    request.stage.name,
                    request.attempt.attempt_number,
                    request.attempt.mode,
                    request.attempt.device,
                    chrono::Utc::now().to_rfc3339(),
                    request.command
                );
                if writeln!(log, "{header}").is_err() {
                    return None;
                }
                Some(log)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot open stage log");
                None
            }
        }
    }

    fn spawn_reader<R>(
        &self,
        reader: Option<R>,
        stream: Stream,
        stage: String,
        capture: Arc<Mutex<Capture>>,
    ) -> Option<JoinHandle<()>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let reader = reader?;
        let filter = Arc::clone(&self.filter);
        Some(tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                match read_line_bounded(&mut reader, &mut buf, MAX_LINE_LENGTH).await {
                    Ok(None) => break,
                    Ok(Some(cut)) => {
                        let mut line = String::from_utf8_lossy(&buf).trim_end().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        if cut {
                            line.push_str("... [truncated]");
                        }

                        let class = filter.classify(&line);
                        match class {
                            LineClass::Noise => continue,
                            LineClass::Normal => debug!(stage = %stage, "{line}"),
                            LineClass::Escalated => error!(stage = %stage, "{line}"),
                        }

                        let mut cap = capture.lock();
                        if class == LineClass::Escalated {
                            cap.escalated += 1;
                            cap.write_log(&format!("[ERROR] {line}"));
                        } else {
                            cap.write_log(&line);
                        }
                        match stream {
                            Stream::Stdout => cap.stdout.push(line),
                            Stream::Stderr => cap.stderr.push(line),
                        }
                    }
                    Err(e) => {
                        warn!(stage = %stage, error = %e, "Error reading stage output");
                        break;
                    }
                }
            }
        }))
    }

    async fn terminate(&self, child: &mut AsyncGroupChild, command: &CommandSpec, stage: &str) {
        if let Some(stop) = command.stop_command() {
            stop_container(&stop, stage).await;
        }
        terminate_process_group(child, self.kill_grace).await;
    }

    async fn drain(&self, handles: Vec<JoinHandle<()>>, killed: bool) {
        for handle in handles {
            if killed {
                // A killed process may leave grandchildren holding the pipe.
                if tokio::time::timeout(self.kill_grace, handle).await.is_err() {
                    debug!("Output reader still busy after kill grace period");
                }
            } else {
                let _ = handle.await;
            }
        }
    }
}

#[async_trait]
impl StageRunner for StageExecutor {
    async fn run(&self, request: ExecutionRequest) -> ExecutionOutcome {
        let started = Instant::now();
        let stage = request.stage.name.clone();

        info!(
            stage = %stage,
            attempt = request.attempt.attempt_number,
            mode = %request.attempt.mode,
            device = %request.attempt.device,
            timeout_secs = request.timeout.as_secs(),
            "Launching stage"
        );

        let capture = Arc::new(Mutex::new(Capture {
            stdout: TailBuffer::new(self.tail_lines),
            stderr: TailBuffer::new(self.tail_lines),
            log: Self::open_log(&request),
            escalated: 0,
        }));

        let mut cmd = Command::new(&request.command.program);
        cmd.args(&request.command.args)
            .envs(&request.command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(stage = %stage, program = %request.command.program, error = %e, "Failed to launch stage");
                let err = StageError::Spawn {
                    program: request.command.program.clone(),
                    reason: e.to_string(),
                };
                capture.lock().write_log(&format!("[ERROR] {err}"));
                return ExecutionOutcome::failure(err, started.elapsed());
            }
        };

        let handles: Vec<JoinHandle<()>> = [
            self.spawn_reader(child.inner().stdout.take(), Stream::Stdout, stage.clone(), Arc::clone(&capture)),
            self.spawn_reader(child.inner().stderr.take(), Stream::Stderr, stage.clone(), Arc::clone(&capture)),
        ]
        .into_iter()
        .flatten()
        .collect();

        let (result, killed) = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => (
                classify_exit(status.code(), exit_signal(&status), request.attempt.mode),
                false,
            ),
            Ok(Err(e)) => {
                error!(stage = %stage, error = %e, "Waiting for stage process failed");
                (Err(StageError::Failure { exit_code: -1 }), false)
            }
            Err(_) => {
                warn!(stage = %stage, timeout_secs = request.timeout.as_secs(), "Stage timed out; killing");
                self.terminate(&mut child, &request.command, &stage).await;
                (
                    Err(StageError::Timeout {
                        timeout_secs: request.timeout.as_secs(),
                    }),
                    true,
                )
            }
        };

        self.drain(handles, killed).await;

        let mut cap = capture.lock();
        match &result {
            Ok(()) => cap.write_log("=== exit 0 ==="),
            Err(e) => cap.write_log(&format!("=== {e} ===")),
        }

        ExecutionOutcome {
            result,
            duration: started.elapsed(),
            stdout_tail: cap.stdout.to_vec(),
            stderr_tail: cap.stderr.to_vec(),
            escalated_lines: cap.escalated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Device;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    #[test]
    fn test_classify_native_exits() {
        let native = ExecutionMode::Native;
        assert_eq!(classify_exit(Some(0), None, native), Ok(()));
        assert_eq!(
            classify_exit(Some(2), None, native),
            Err(StageError::Failure { exit_code: 2 })
        );
        assert_eq!(
            classify_exit(None, Some(9), native),
            Err(StageError::Crash { signal: CrashSignal::OutOfMemory })
        );
        assert_eq!(
            classify_exit(Some(-11), None, native),
            Err(StageError::Crash { signal: CrashSignal::Segfault })
        );
        // Outside a container 137 is an ordinary exit code.
        assert_eq!(
            classify_exit(Some(137), None, native),
            Err(StageError::Failure { exit_code: 137 })
        );
    }

    #[test]
    fn test_classify_container_signal_codes() {
        let container = ExecutionMode::Container;
        assert_eq!(
            classify_exit(Some(137), None, container),
            Err(StageError::Crash { signal: CrashSignal::OutOfMemory })
        );
        assert_eq!(
            classify_exit(Some(139), None, container),
            Err(StageError::Crash { signal: CrashSignal::Segfault })
        );
        assert_eq!(
            classify_exit(Some(128), None, container),
            Err(StageError::Failure { exit_code: 128 })
        );
        assert_eq!(
            classify_exit(Some(1), None, container),
            Err(StageError::Failure { exit_code: 1 })
        );
    }

    #[test]
    fn test_combined_tail() {
        let outcome = ExecutionOutcome::success(Duration::ZERO)
            .with_tails(vec!["out".into()], vec!["err".into()]);
        assert_eq!(outcome.combined_tail(), vec!["out", "[stderr] err"]);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use pretty_assertions::assert_eq;

        fn executor() -> StageExecutor {
            let filter = OutputFilter::new(&[r"^progress"], &[r"error:"]).unwrap();
            StageExecutor::new(filter, 3, Duration::from_millis(200))
        }

        fn request(script: &str, timeout: Duration, log_path: Option<PathBuf>) -> ExecutionRequest {
            ExecutionRequest {
                stage: StageDefinition::new("worker", "sh"),
                attempt: ExecutionAttempt {
                    mode: ExecutionMode::Native,
                    device: Device::Cpu,
                    attempt_number: 1,
                },
                command: CommandSpec {
                    program: "sh".into(),
                    args: vec!["-c".into(), script.into()],
                    env: BTreeMap::from([("STAGE_VALUE".to_string(), "42".to_string())]),
                    container_name: None,
                },
                timeout,
                log_path,
            }
        }

        #[tokio::test]
        async fn test_success_and_env() {
            let outcome = executor()
                .run(request("echo value=$STAGE_VALUE", Duration::from_secs(10), None))
                .await;
            assert!(outcome.is_success());
            assert_eq!(outcome.stdout_tail, vec!["value=42"]);
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_failure() {
            let outcome = executor()
                .run(request("echo bad >&2; exit 3", Duration::from_secs(10), None))
                .await;
            assert_eq!(outcome.result, Err(StageError::Failure { exit_code: 3 }));
            assert_eq!(outcome.stderr_tail, vec!["bad"]);
        }

        #[tokio::test]
        async fn test_kill_signals_are_crashes() {
            let oom = executor()
                .run(request("kill -9 $$", Duration::from_secs(10), None))
                .await;
            assert_eq!(
                oom.result,
                Err(StageError::Crash { signal: CrashSignal::OutOfMemory })
            );

            let segv = executor()
                .run(request("kill -11 $$", Duration::from_secs(10), None))
                .await;
            assert_eq!(
                segv.result,
                Err(StageError::Crash { signal: CrashSignal::Segfault })
            );
        }

        #[tokio::test]
        async fn test_timeout_preserves_tail() {
            let outcome = executor()
                .run(request(
                    "echo one; echo two; echo three; echo four; sleep 5",
                    Duration::from_millis(500),
                    None,
                ))
                .await;
            assert!(matches!(outcome.result, Err(StageError::Timeout { .. })));
            assert_eq!(outcome.stdout_tail, vec!["two", "three", "four"]);
            assert!(outcome.duration < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_timeout_stops_background_children() {
            let dir = tempfile::tempdir().unwrap();
            let ticks = dir.path().join("ticks");
            let script = format!(
                "(while true; do echo tick >> '{}'; sleep 0.1; done) & wait",
                ticks.display()
            );
            let outcome = executor()
                .run(request(&script, Duration::from_millis(500), None))
                .await;
            assert!(matches!(outcome.result, Err(StageError::Timeout { .. })));
            assert!(outcome.duration < Duration::from_secs(3));

            tokio::time::sleep(Duration::from_millis(300)).await;
            let settled = std::fs::read_to_string(&ticks).unwrap().lines().count();
            tokio::time::sleep(Duration::from_millis(500)).await;
            let later = std::fs::read_to_string(&ticks).unwrap().lines().count();
            assert_eq!(later, settled);
        }

        #[tokio::test]
        async fn test_carriage_returns_split_and_long_lines_are_cut() {
            let script = "i=0; while [ $i -lt 500 ]; do printf 'frame %d\\r' $i; i=$((i+1)); done; \
                          head -c 20000 /dev/zero | tr '\\0' a";
            let outcome = executor()
                .run(request(script, Duration::from_secs(20), None))
                .await;

            assert!(outcome.is_success());
            assert_eq!(outcome.stdout_tail.len(), 3);
            assert_eq!(outcome.stdout_tail[..2].to_vec(), vec!["frame 498", "frame 499"]);
            let long = &outcome.stdout_tail[2];
            assert!(long.ends_with("... [truncated]"));
            assert_eq!(long.len(), MAX_LINE_LENGTH + "... [truncated]".len());
        }

        #[tokio::test]
        async fn test_noise_dropped_and_keywords_escalated() {
            let dir = tempfile::tempdir().unwrap();
            let log = dir.path().join("logs").join("worker.log");
            let outcome = executor()
                .run(request(
                    "echo progress 10%; echo Error: disk full; echo done",
                    Duration::from_secs(10),
                    Some(log.clone()),
                ))
                .await;

            assert!(outcome.is_success());
            assert_eq!(outcome.escalated_lines, 1);
            assert_eq!(outcome.stdout_tail, vec!["Error: disk full", "done"]);

            let text = std::fs::read_to_string(&log).unwrap();
            assert!(text.starts_with("=== worker attempt 1 mode=native device=cpu"));
            assert!(text.contains("[ERROR] Error: disk full"));
            assert!(!text.contains("progress 10%"));
            assert!(text.trim_end().ends_with("=== exit 0 ==="));
        }

        #[tokio::test]
        async fn test_missing_program_is_spawn_error() {
            let mut req = request("true", Duration::from_secs(1), None);
            req.command.program = "/nonexistent/mediaflow-stage".into();
            let outcome = executor().run(req).await;
            assert!(matches!(outcome.result, Err(StageError::Spawn { .. })));
        }
    }
}
