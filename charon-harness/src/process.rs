//! Daemon process control.
//!
//! The daemon is driven only through its external interface: a JSON config
//! passed with `--config`, progress markers on stdout, a single `q` byte on
//! stdin to quit, and its exit code. Stdout and stderr are read on dedicated
//! threads that forward lines over channels; every wait on them is bounded by
//! a deadline via `recv_timeout`.

use std::ffi::OsString;
use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::action_config::ActionConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::logging::ScenarioLog;
use crate::settings::{
    DEFAULT_OPERATION_TIMEOUT, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_STARTUP_TIMEOUT, HarnessSettings,
};

/// Printed once by the daemon after it has loaded its config and started watching.
pub const STARTUP_MARKER: &str = "Charon started";
/// Printed by the daemon once per completed file action.
pub const OPERATION_MARKER: &str = "Operation succeeded";
/// Written to the daemon's stdin to request a graceful shutdown.
pub const QUIT_COMMAND: &[u8] = b"q";
/// Exit code of a clean shutdown.
pub const CLEAN_EXIT_CODE: i32 = 0;

/// How long to keep collecting output after the process has exited.
const DRAIN_GRACE: Duration = Duration::from_millis(200);
/// Poll interval while waiting for the process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of one daemon process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    NotStarted,
    Starting,
    Ready,
    AwaitingOperations,
    ShuttingDown,
    Exited,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::AwaitingOperations => "awaiting operations",
            Self::ShuttingDown => "shutting down",
            Self::Exited => "exited",
        };
        f.write_str(state)
    }
}

/// Program plus leading arguments used to start the daemon.
///
/// The `--config`, `--log` and `--verbose` flags are appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl DaemonCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn display(&self) -> String {
        let mut parts = vec![self.program.display().to_string()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }
}

/// Everything needed to launch one daemon.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    pub command: DaemonCommand,
    /// Where the configuration artifact is written.
    pub config_path: PathBuf,
    /// Passed to the daemon as `--log`.
    pub log_path: PathBuf,
    pub verbose: bool,
    pub startup_timeout: Duration,
    pub operation_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub env: Vec<(OsString, OsString)>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn new(command: DaemonCommand, config_path: impl Into<PathBuf>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            command,
            config_path: config_path.into(),
            log_path: log_path.into(),
            verbose: true,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            env: Vec::new(),
            working_dir: None,
        }
    }

    /// Options for the configured daemon binary with the configured timeouts.
    pub fn from_settings(
        settings: &HarnessSettings,
        config_path: impl Into<PathBuf>,
        log_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            verbose: settings.daemon_verbose,
            startup_timeout: settings.startup_timeout,
            operation_timeout: settings.operation_timeout,
            shutdown_timeout: settings.shutdown_timeout,
            ..Self::new(
                DaemonCommand::new(&settings.daemon_binary),
                config_path,
                log_path,
            )
        }
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Outcome of a clean shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub exit_code: Option<i32>,
    /// Every stdout line consumed over the daemon's lifetime.
    pub transcript: Vec<String>,
    pub stderr: String,
    pub elapsed: Duration,
    pub operations_observed: usize,
}

enum WaitFailure {
    Timeout { observed: usize },
    Closed { observed: usize },
}

/// Owns one running daemon.
///
/// Dropping the controller kills the process if it is still running.
pub struct DaemonController {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout_lines: Receiver<String>,
    stderr_lines: Receiver<String>,
    transcript: Vec<String>,
    stderr: String,
    state: DaemonState,
    operations: usize,
    exit_code: Option<i32>,
    options: LaunchOptions,
    log: ScenarioLog,
    started_at: Instant,
}

impl DaemonController {
    /// Write `config`, start the daemon and wait for its startup marker.
    pub fn launch(config: &ActionConfig, options: LaunchOptions, log: ScenarioLog) -> HarnessResult<Self> {
        config.write_to(&options.config_path)?;

        let mut command = Command::new(&options.command.program);
        command
            .args(&options.command.args)
            .arg("--config")
            .arg(&options.config_path)
            .arg("--log")
            .arg(&options.log_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(options.env.iter().map(|(k, v)| (k, v)));
        if options.verbose {
            command.arg("--verbose");
        }
        if let Some(dir) = &options.working_dir {
            command.current_dir(dir);
        }

        log.info(format!("Launching daemon: {}", options.command.display()));
        let mut child = command.spawn().map_err(|e| {
            HarnessError::ProcessStartFailed(format!("{}: {e}", options.command.display()))
        })?;
        let pid = child.id();

        let stdin = child.stdin.take();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(HarnessError::ProcessStartFailed(
                "daemon pipes were not captured".to_string(),
            ));
        };

        let mut controller = Self {
            child: Some(child),
            stdin,
            stdout_lines: spawn_line_reader(stdout, "charon-stdout"),
            stderr_lines: spawn_line_reader(stderr, "charon-stderr"),
            transcript: Vec::new(),
            stderr: String::new(),
            state: DaemonState::Starting,
            operations: 0,
            exit_code: None,
            options,
            log,
            started_at: Instant::now(),
        };
        tracing::debug!(pid, "daemon spawned");

        let timeout = controller.options.startup_timeout;
        match controller.wait_for_markers(STARTUP_MARKER, 1, timeout) {
            Ok(()) => {
                controller.state = DaemonState::Ready;
                controller.log.info(format!("Daemon ready (pid {pid})"));
                Ok(controller)
            }
            Err(WaitFailure::Timeout { .. }) => Err(HarnessError::StartupTimeout {
                marker: STARTUP_MARKER,
                timeout,
            }),
            Err(WaitFailure::Closed { observed }) => Err(controller.closed_before_startup(observed)),
        }
    }

    /// The daemon closed stdout without announcing itself; report its exit
    /// code if it has one.
    fn closed_before_startup(&mut self, observed: usize) -> HarnessError {
        let status = self.wait_for_exit(self.options.shutdown_timeout);
        self.finish(status);
        match self.exit_code {
            Some(code) if code != CLEAN_EXIT_CODE => HarnessError::UnexpectedExitCode {
                code: Some(code),
                stderr: self.stderr.clone(),
            },
            None if status.is_some() => HarnessError::UnexpectedExitCode {
                code: None,
                stderr: self.stderr.clone(),
            },
            _ => HarnessError::OutputClosed {
                marker: STARTUP_MARKER,
                observed,
                expected: 1,
            },
        }
    }

    /// Block until `expected` operation markers have been read.
    ///
    /// Returns immediately when `expected` is zero.
    pub fn await_operations(&mut self, expected: usize) -> HarnessResult<()> {
        self.require_running("await_operations")?;
        if expected == 0 {
            return Ok(());
        }

        self.state = DaemonState::AwaitingOperations;
        let timeout = self.options.operation_timeout;
        let result = self.wait_for_markers(OPERATION_MARKER, expected, timeout);
        self.state = DaemonState::Ready;

        match result {
            Ok(()) => {
                self.log
                    .debug(format!("Observed {expected} '{OPERATION_MARKER}' markers"));
                Ok(())
            }
            Err(WaitFailure::Timeout { observed }) => Err(HarnessError::OperationTimeout {
                marker: OPERATION_MARKER,
                observed,
                expected,
                timeout,
            }),
            Err(WaitFailure::Closed { observed }) => Err(HarnessError::OutputClosed {
                marker: OPERATION_MARKER,
                observed,
                expected,
            }),
        }
    }

    /// Send `q`, wait for exit and check the exit code.
    ///
    /// The process is always terminated before this returns, whatever the
    /// outcome.
    pub fn shutdown(&mut self) -> HarnessResult<ShutdownReport> {
        self.require_running("shutdown")?;
        self.state = DaemonState::ShuttingDown;

        if let Some(mut stdin) = self.stdin.take() {
            let sent = stdin.write_all(QUIT_COMMAND).and_then(|()| stdin.flush());
            if let Err(error) = sent {
                self.log
                    .warn(format!("Failed to send quit command: {error}"));
            }
        }

        let timeout = self.options.shutdown_timeout;
        let status = self.wait_for_exit(timeout);
        let timed_out = status.is_none();
        let status = status.or_else(|| self.terminate());
        self.finish(status);

        if timed_out {
            self.log
                .error(format!("Daemon ignored quit for {timeout:?}; terminated"));
            return Err(HarnessError::ShutdownTimeout(timeout));
        }
        if self.exit_code != Some(CLEAN_EXIT_CODE) {
            return Err(HarnessError::UnexpectedExitCode {
                code: self.exit_code,
                stderr: self.stderr.clone(),
            });
        }

        self.log.info("Daemon exited cleanly");
        Ok(ShutdownReport {
            exit_code: self.exit_code,
            transcript: self.transcript.clone(),
            stderr: self.stderr.clone(),
            elapsed: self.started_at.elapsed(),
            operations_observed: self.operations,
        })
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Total operation markers read so far, across all barriers.
    pub fn operations_observed(&self) -> usize {
        self.operations
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Stderr collected so far. Complete only once the daemon has exited.
    pub fn stderr_output(&self) -> &str {
        &self.stderr
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn require_running(&self, operation: &'static str) -> HarnessResult<()> {
        match self.state {
            DaemonState::Ready | DaemonState::AwaitingOperations => Ok(()),
            state => Err(HarnessError::InvalidState { operation, state }),
        }
    }

    fn wait_for_markers(&mut self, marker: &'static str, expected: usize, timeout: Duration) -> Result<(), WaitFailure> {
        let deadline = Instant::now() + timeout;
        let mut observed = 0;
        while observed < expected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.stdout_lines.recv_timeout(remaining) {
                Ok(line) => {
                    if line.contains(marker) {
                        observed += 1;
                    }
                    self.record_stdout(line);
                }
                Err(RecvTimeoutError::Timeout) => return Err(WaitFailure::Timeout { observed }),
                Err(RecvTimeoutError::Disconnected) => return Err(WaitFailure::Closed { observed }),
            }
        }
        Ok(())
    }

    fn record_stdout(&mut self, line: String) {
        if line.contains(OPERATION_MARKER) {
            self.operations += 1;
        }
        self.log.daemon_stdout(line.as_str());
        self.transcript.push(line);
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Some(status),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%error, "failed to poll daemon status");
                    return None;
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    /// Kill the process if it is still running and reap it.
    fn terminate(&mut self) -> Option<ExitStatus> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => Some(status),
            _ => {
                let _ = child.kill();
                child.wait().ok()
            }
        }
    }

    /// Record the exit and collect whatever output is still in flight.
    fn finish(&mut self, status: Option<ExitStatus>) {
        self.stdin = None;
        self.exit_code = status.and_then(|status| status.code());
        self.state = DaemonState::Exited;

        let deadline = Instant::now() + DRAIN_GRACE;
        while let Some(line) = recv_until(&self.stdout_lines, deadline) {
            self.record_stdout(line);
        }
        while let Some(line) = recv_until(&self.stderr_lines, deadline) {
            self.log.daemon_stderr(line.as_str());
            self.stderr.push_str(&line);
            self.stderr.push('\n');
        }
    }
}

impl Drop for DaemonController {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut()
            && matches!(child.try_wait(), Ok(None))
        {
            tracing::debug!(pid = child.id(), "terminating daemon on drop");
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn recv_until(lines: &Receiver<String>, deadline: Instant) -> Option<String> {
    lines
        .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .ok()
}

/// Forward lines from `reader` over a channel until EOF.
///
/// The channel disconnects when the stream closes. Invalid UTF-8 is replaced
/// rather than ending the stream.
fn spawn_line_reader<R: Read + Send + 'static>(reader: R, name: &str) -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut buffer = Vec::new();
            loop {
                buffer.clear();
                match reader.read_until(b'\n', &mut buffer) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buffer)
                            .trim_end_matches(['\n', '\r'])
                            .to_string();
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    if let Err(error) = spawned {
        tracing::warn!(%error, stream = name, "failed to spawn output reader");
    }
    rx
}
