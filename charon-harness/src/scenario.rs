//! Scenario runner.
//!
//! A scenario body receives a [`ScenarioContext`] holding a fresh sandbox,
//! an oracle over it and a lazily launched daemon. The runner owns the
//! lifecycle around the body: sandbox setup, daemon shutdown if the body did
//! not shut it down, artifact capture and teardown.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::action_config::ActionConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::fixtures::FixtureOracle;
use crate::logging::{LogConfig, LogLevel, Phase, ScenarioLog};
use crate::process::{DaemonCommand, DaemonController, DaemonState, LaunchOptions, ShutdownReport};
use crate::sandbox::Sandbox;
use crate::scenarios::ScenarioCase;
use crate::settings::HarnessSettings;

/// File name of the configuration artifact inside the sandbox.
pub const CONFIG_FILE_NAME: &str = "charon_config.json";
/// File name passed to the daemon as `--log`.
pub const DAEMON_LOG_FILE_NAME: &str = "charon_log.txt";

/// Result of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioOutcome {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_ms: u64,
    pub operations_observed: usize,
    /// Set when the sandbox was kept for inspection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

/// Results of a catalog run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub outcomes: Vec<ScenarioOutcome>,
}

impl RunSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioOutcome> {
        self.outcomes.iter().filter(|outcome| !outcome.passed)
    }
}

/// State handed to a scenario body.
pub struct ScenarioContext {
    name: String,
    sandbox: Sandbox,
    oracle: FixtureOracle,
    log: ScenarioLog,
    settings: HarnessSettings,
    command: DaemonCommand,
    daemon: Option<DaemonController>,
    report: Option<ShutdownReport>,
}

impl ScenarioContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        self.sandbox.root()
    }

    /// Absolute path of `relative` inside the sandbox.
    pub fn path(&self, relative: impl AsRef<Path>) -> HarnessResult<PathBuf> {
        self.sandbox.resolve(relative)
    }

    pub fn oracle(&self) -> &FixtureOracle {
        &self.oracle
    }

    pub fn log(&self) -> &ScenarioLog {
        &self.log
    }

    /// Validate `config`, write it into the sandbox and start the daemon.
    pub fn launch(&mut self, config: &ActionConfig) -> HarnessResult<()> {
        if let Some(daemon) = &self.daemon {
            return Err(HarnessError::InvalidState {
                operation: "launch",
                state: daemon.state(),
            });
        }
        config.validate()?;

        let options = LaunchOptions {
            command: self.command.clone(),
            working_dir: Some(self.sandbox.root().to_path_buf()),
            ..LaunchOptions::from_settings(
                &self.settings,
                self.sandbox.resolve(CONFIG_FILE_NAME)?,
                self.sandbox.resolve(DAEMON_LOG_FILE_NAME)?,
            )
        };
        let daemon = DaemonController::launch(config, options, self.log.clone())?;
        self.log.phase(
            Phase::Execute,
            format!("daemon ready with {} watcher(s)", config.watchers.len()),
            "DAEMON_READY",
        );
        self.daemon = Some(daemon);
        Ok(())
    }

    /// Wait for `expected` more operation markers.
    pub fn await_operations(&mut self, expected: usize) -> HarnessResult<()> {
        self.daemon_mut("await_operations")?.await_operations(expected)?;
        self.log.phase(
            Phase::Verify,
            format!("observed {expected} operation marker(s)"),
            "OPERATIONS_OBSERVED",
        );
        Ok(())
    }

    /// Quit the daemon and require a clean exit.
    pub fn shutdown(&mut self) -> HarnessResult<ShutdownReport> {
        let report = self.daemon_mut("shutdown")?.shutdown()?;
        self.report = Some(report.clone());
        Ok(report)
    }

    pub fn operations_observed(&self) -> usize {
        self.daemon
            .as_ref()
            .map_or(0, DaemonController::operations_observed)
    }

    /// Fail the scenario with `message` unless `condition` holds.
    pub fn check(&self, condition: bool, message: impl Into<String>) -> HarnessResult<()> {
        let message = message.into();
        if condition {
            self.log.oracle(LogLevel::Debug, format!("ok: {message}"));
            Ok(())
        } else {
            self.log.oracle(LogLevel::Error, format!("failed: {message}"));
            Err(HarnessError::AssertionFailed(message))
        }
    }

    pub fn check_eq<T: PartialEq + Debug>(&self, actual: T, expected: T, what: &str) -> HarnessResult<()> {
        if actual == expected {
            self.check(true, what)
        } else {
            self.check(false, format!("{what}: expected {expected:?}, got {actual:?}"))
        }
    }

    fn daemon_mut(&mut self, operation: &'static str) -> HarnessResult<&mut DaemonController> {
        self.daemon.as_mut().ok_or_else(|| HarnessError::InvalidState {
            operation,
            state: DaemonState::NotStarted,
        })
    }

    fn daemon_running(&self) -> bool {
        self.daemon.as_ref().is_some_and(|daemon| {
            matches!(
                daemon.state(),
                DaemonState::Ready | DaemonState::AwaitingOperations
            )
        })
    }
}

/// Runs scenarios against one daemon command.
pub struct ScenarioRunner {
    settings: HarnessSettings,
    command: DaemonCommand,
}

impl ScenarioRunner {
    pub fn new(settings: HarnessSettings) -> Self {
        let command = DaemonCommand::new(&settings.daemon_binary);
        Self { settings, command }
    }

    /// Use `command` instead of the configured daemon binary.
    pub fn with_command(mut self, command: DaemonCommand) -> Self {
        self.command = command;
        self
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn run_case(&self, case: &ScenarioCase) -> ScenarioOutcome {
        self.run(case.name, case.body)
    }

    pub fn run_all<'a>(&self, cases: impl IntoIterator<Item = &'a ScenarioCase>) -> RunSummary {
        let started_at = Utc::now();
        let start = Instant::now();
        let outcomes: Vec<ScenarioOutcome> = cases.into_iter().map(|case| self.run_case(case)).collect();
        let passed = outcomes.iter().filter(|outcome| outcome.passed).count();
        RunSummary {
            started_at,
            total: outcomes.len(),
            passed,
            failed: outcomes.len() - passed,
            duration_ms: start.elapsed().as_millis() as u64,
            outcomes,
        }
    }

    /// Run `body` in a fresh sandbox and report the outcome.
    pub fn run<F>(&self, name: &str, body: F) -> ScenarioOutcome
    where
        F: FnOnce(&mut ScenarioContext) -> HarnessResult<()>,
    {
        let start = Instant::now();
        let log = ScenarioLog::new(
            name,
            LogConfig {
                log_dir: Some(self.settings.log_dir.clone()),
                ..Default::default()
            },
        );

        let sandbox = match Sandbox::create(&self.settings.sandbox_base, name) {
            Ok(sandbox) => sandbox,
            Err(error) => return failed_outcome(name, &log, start, &error),
        };
        log.phase(
            Phase::Setup,
            format!("sandbox at {}", sandbox.root().display()),
            "SANDBOX_CREATED",
        );

        let mut ctx = ScenarioContext {
            name: name.to_string(),
            oracle: FixtureOracle::new(sandbox.root()).with_log(log.clone()),
            sandbox,
            log: log.clone(),
            settings: self.settings.clone(),
            command: self.command.clone(),
            daemon: None,
            report: None,
        };

        let mut result = body(&mut ctx);
        if ctx.daemon_running()
            && let Err(error) = ctx.shutdown()
        {
            if result.is_ok() {
                result = Err(error);
            } else {
                log.warn(format!("Shutdown after failure also failed: {error}"));
            }
        }

        self.capture_artifacts(&ctx);
        let operations_observed = ctx.operations_observed();
        let ScenarioContext { mut sandbox, .. } = ctx;

        let passed = result.is_ok();
        let kept = !passed && self.settings.keep_sandbox_on_failure;
        if kept {
            sandbox.keep();
            log.phase(
                Phase::Cleanup,
                format!("sandbox kept at {}", sandbox.root().display()),
                "SANDBOX_KEPT",
            );
        } else {
            match sandbox.destroy() {
                Ok(()) => {
                    log.phase(Phase::Cleanup, "sandbox removed", "SANDBOX_REMOVED");
                }
                Err(error) => log.warn(format!("Sandbox teardown failed: {error}")),
            }
        }

        let (error, error_code) = match &result {
            Ok(()) => (None, None),
            Err(error) => {
                log.error(format!("Scenario failed: {error}"));
                (Some(error.to_string()), Some(error.code().to_string()))
            }
        };
        if passed {
            log.info("Scenario passed");
        }

        ScenarioOutcome {
            name: name.to_string(),
            passed,
            error,
            error_code,
            duration_ms: start.elapsed().as_millis() as u64,
            operations_observed,
            sandbox: kept.then(|| sandbox.root().to_path_buf()),
            log_path: log.log_path().map(Path::to_path_buf),
        }
    }

    fn capture_artifacts(&self, ctx: &ScenarioContext) {
        let mut captured = Vec::new();
        if let Some(daemon) = &ctx.daemon {
            let transcript = daemon.transcript().join("\n");
            if let Ok(path) = ctx.log.capture_artifact_text("daemon_stdout", &transcript) {
                captured.push(path.display().to_string());
            }
            if !daemon.stderr_output().is_empty()
                && let Ok(path) = ctx.log.capture_artifact_text("daemon_stderr", daemon.stderr_output())
            {
                captured.push(path.display().to_string());
            }
        }
        if let Ok(Some(config)) = ctx.oracle.read_file(CONFIG_FILE_NAME)
            && let Ok(path) = ctx.log.capture_artifact_text("charon_config", &config)
        {
            captured.push(path.display().to_string());
        }
        if let Some(report) = &ctx.report
            && let Ok(path) = ctx.log.capture_artifact_json("shutdown_report", report)
        {
            captured.push(path.display().to_string());
        }
        if let Ok(path) = ctx.log.capture_artifact_json("log_summary", &ctx.log.summary()) {
            captured.push(path.display().to_string());
        }
        if !captured.is_empty() {
            ctx.log.phase_with_artifacts(
                Phase::Cleanup,
                LogLevel::Debug,
                "artifacts captured",
                "ARTIFACTS_CAPTURED",
                captured,
            );
        }
    }
}

fn failed_outcome(name: &str, log: &ScenarioLog, start: Instant, error: &HarnessError) -> ScenarioOutcome {
    log.error(format!("Scenario setup failed: {error}"));
    ScenarioOutcome {
        name: name.to_string(),
        passed: false,
        error: Some(error.to_string()),
        error_code: Some(error.code().to_string()),
        duration_ms: start.elapsed().as_millis() as u64,
        operations_observed: 0,
        sandbox: None,
        log_path: log.log_path().map(Path::to_path_buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(base: &Path) -> ScenarioRunner {
        let mut settings = HarnessSettings::default();
        settings.sandbox_base = base.join("sandboxes");
        settings.log_dir = base.join("logs");
        ScenarioRunner::new(settings)
    }

    #[test]
    fn test_body_without_daemon_passes_and_cleans_up() {
        let base = tempfile::tempdir().unwrap();
        let mut root = PathBuf::new();
        let outcome = runner(base.path()).run("oracle only", |ctx| {
            root = ctx.root().to_path_buf();
            ctx.oracle().write_file("Src/a", "x")?;
            ctx.check_eq(ctx.oracle().file_count("Src")?, Some(1), "Src count")
        });
        assert!(outcome.passed, "{:?}", outcome.error);
        assert!(!root.exists());
        assert!(outcome.sandbox.is_none());
        assert!(outcome.log_path.unwrap().is_file());
        let summary = base.path().join("logs/artifacts/oracle_only/log_summary.json");
        assert!(summary.is_file(), "{}", summary.display());
    }

    #[test]
    fn test_failed_check_keeps_sandbox_when_configured() {
        let base = tempfile::tempdir().unwrap();
        let mut runner = runner(base.path());
        runner.settings.keep_sandbox_on_failure = true;
        let outcome = runner.run("failing", |ctx| ctx.check(false, "Dst should hold 2 files"));
        assert!(!outcome.passed);
        assert_eq!(outcome.error_code.as_deref(), Some("ASSERTION_FAILED"));
        assert!(outcome.error.unwrap().contains("Dst should hold 2 files"));
        assert!(outcome.sandbox.unwrap().is_dir());
    }

    #[test]
    fn test_await_without_launch_is_invalid_state() {
        let base = tempfile::tempdir().unwrap();
        let outcome = runner(base.path()).run("no daemon", |ctx| ctx.await_operations(1));
        assert_eq!(outcome.error_code.as_deref(), Some("INVALID_STATE"));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_launch() {
        let base = tempfile::tempdir().unwrap();
        let outcome = runner(base.path()).run("bad config", |ctx| {
            let config = ActionConfig::new().watcher(crate::action_config::WatcherConfig::new(ctx.path("Src")?));
            ctx.launch(&config)
        });
        assert_eq!(outcome.error_code.as_deref(), Some("CONFIG_INVALID"));
    }

    #[test]
    fn test_summary_counts() {
        let base = tempfile::tempdir().unwrap();
        fn pass(_: &mut ScenarioContext) -> HarnessResult<()> {
            Ok(())
        }
        fn fail(ctx: &mut ScenarioContext) -> HarnessResult<()> {
            ctx.check(false, "nope")
        }
        let cases = [
            ScenarioCase { name: "pass", description: "passes", body: pass },
            ScenarioCase { name: "fail", description: "fails", body: fail },
        ];
        let summary = runner(base.path()).run_all(&cases);
        assert_eq!((summary.total, summary.passed, summary.failed), (2, 1, 1));
        assert!(!summary.all_passed());
        assert_eq!(summary.failures().next().unwrap().name, "fail");
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["outcomes"][1]["error_code"], "ASSERTION_FAILED");
    }
}
