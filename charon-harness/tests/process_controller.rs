//! Controller behaviour against `/bin/sh` scripts standing in for the daemon.
//!
//! The harness appends `--config <path> --log <path> [--verbose]` to the
//! command, which the scripts receive as positional parameters and ignore.

#![cfg(unix)]

use std::path::Path;
use std::time::Duration;

use charon_harness::scenarios;
use charon_harness::{
    ActionConfig, DaemonCommand, DaemonController, DaemonState, HarnessError, HarnessSettings,
    LaunchOptions, ScenarioLog, ScenarioRunner,
};

#[ctor::ctor]
fn setup() {
    charon_harness::init_test_logging();
}

// ---------------------------------------------------------------------------
// Shared builders
// ---------------------------------------------------------------------------

/// Starts, reports two operations, then exits 0 once it reads `q`.
const WELL_BEHAVED: &str = r#"
echo "Charon started"
echo "Operation succeeded"
echo "Operation succeeded"
cmd=$(head -c 1)
[ "$cmd" = "q" ] && exit 0
exit 9
"#;

fn fake_daemon(script: &str) -> DaemonCommand {
    DaemonCommand::new("/bin/sh").arg("-c").arg(script).arg("charon")
}

fn options(dir: &Path, script: &str) -> LaunchOptions {
    LaunchOptions::new(
        fake_daemon(script),
        dir.join("charon_config.json"),
        dir.join("charon_log.txt"),
    )
}

fn launch(options: LaunchOptions) -> Result<DaemonController, HarnessError> {
    DaemonController::launch(&ActionConfig::new(), options, ScenarioLog::in_memory("controller"))
}

/// Script that records its pid in `dir/pid` before running `rest`.
fn pid_script(dir: &Path, rest: &str) -> String {
    format!("echo $$ > '{}'; {rest}", dir.join("pid").display())
}

fn recorded_pid(dir: &Path) -> u32 {
    std::fs::read_to_string(dir.join("pid"))
        .unwrap()
        .trim()
        .parse()
        .unwrap()
}

fn is_alive(pid: u32) -> bool {
    std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .unwrap()
        .success()
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn test_launch_await_and_clean_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = launch(options(dir.path(), WELL_BEHAVED)).unwrap();
    assert_eq!(daemon.state(), DaemonState::Ready);
    assert!(daemon.pid().is_some());

    daemon.await_operations(0).unwrap();
    daemon.await_operations(2).unwrap();
    assert_eq!(daemon.operations_observed(), 2);

    let report = daemon.shutdown().unwrap();
    assert_eq!(report.exit_code, Some(0));
    assert_eq!(report.operations_observed, 2);
    assert_eq!(report.transcript[0], "Charon started");
    assert_eq!(daemon.state(), DaemonState::Exited);

    let config = std::fs::read_to_string(dir.path().join("charon_config.json")).unwrap();
    assert_eq!(config, "[]");
}

#[test]
fn test_daemon_receives_config_and_log_flags() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"
echo "args: $*"
echo "Charon started"
head -c 1 >/dev/null
exit 0
"#;
    let mut daemon = launch(options(dir.path(), script)).unwrap();
    let report = daemon.shutdown().unwrap();
    let args = &report.transcript[0];
    assert!(args.contains("--config"), "{args}");
    assert!(args.contains("charon_config.json"), "{args}");
    assert!(args.contains("--log"), "{args}");
    assert!(args.ends_with("--verbose"), "{args}");
}

#[test]
fn test_extra_environment_reaches_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let script = r#"
echo "mark=$CHARON_STUB_MARK"
echo "Charon started"
head -c 1 >/dev/null
exit 0
"#;
    let opts = options(dir.path(), script).env("CHARON_STUB_MARK", "sandbox-7");
    let mut daemon = launch(opts).unwrap();
    let report = daemon.shutdown().unwrap();
    assert_eq!(report.transcript[0], "mark=sandbox-7");
}

#[test]
fn test_operations_accumulate_across_barriers() {
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = launch(options(dir.path(), WELL_BEHAVED)).unwrap();
    daemon.await_operations(1).unwrap();
    daemon.await_operations(1).unwrap();
    assert_eq!(daemon.operations_observed(), 2);
    daemon.shutdown().unwrap();
}

// ---------------------------------------------------------------------------
// Failure taxonomy
// ---------------------------------------------------------------------------

#[test]
fn test_silent_daemon_is_startup_timeout_and_process_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let script = pid_script(dir.path(), "exec sleep 30");
    let opts = options(dir.path(), &script).startup_timeout(Duration::from_millis(300));
    let error = launch(opts).err().unwrap();
    assert!(matches!(error, HarnessError::StartupTimeout { .. }), "{error}");
    assert!(!is_alive(recorded_pid(dir.path())));
}

#[test]
fn test_failed_startup_reports_exit_code_and_stderr() {
    let dir = tempfile::tempdir().unwrap();
    let error = launch(options(dir.path(), "echo 'config unreadable' >&2; exit 3"))
        .err()
        .unwrap();
    match error {
        HarnessError::UnexpectedExitCode { code, stderr } => {
            assert_eq!(code, Some(3));
            assert!(stderr.contains("config unreadable"), "{stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_missing_operations_time_out() {
    let dir = tempfile::tempdir().unwrap();
    let script = "echo 'Charon started'; echo 'Operation succeeded'; exec sleep 5";
    let opts = options(dir.path(), script).operation_timeout(Duration::from_millis(300));
    let mut daemon = launch(opts).unwrap();
    match daemon.await_operations(3).unwrap_err() {
        HarnessError::OperationTimeout {
            observed, expected, ..
        } => {
            assert_eq!(observed, 1);
            assert_eq!(expected, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_output_closing_early_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let script = "echo 'Charon started'; echo 'Operation succeeded'; exit 0";
    let mut daemon = launch(options(dir.path(), script)).unwrap();
    match daemon.await_operations(3).unwrap_err() {
        HarnessError::OutputClosed {
            observed, expected, ..
        } => {
            assert_eq!(observed, 1);
            assert_eq!(expected, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_ignored_quit_is_shutdown_timeout_and_process_is_killed() {
    let dir = tempfile::tempdir().unwrap();
    let script = "echo 'Charon started'; exec sleep 30";
    let opts = options(dir.path(), script).shutdown_timeout(Duration::from_millis(300));
    let mut daemon = launch(opts).unwrap();
    let pid = daemon.pid().unwrap();
    let error = daemon.shutdown().unwrap_err();
    assert!(matches!(error, HarnessError::ShutdownTimeout(_)), "{error}");
    assert_eq!(daemon.state(), DaemonState::Exited);
    assert!(!is_alive(pid));
}

#[test]
fn test_dropping_controller_kills_running_daemon() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = launch(options(dir.path(), "echo 'Charon started'; exec sleep 30")).unwrap();
    let pid = daemon.pid().unwrap();
    assert!(is_alive(pid));
    drop(daemon);
    assert!(!is_alive(pid));
}

#[test]
fn test_non_zero_exit_after_quit() {
    let dir = tempfile::tempdir().unwrap();
    let script = "echo 'Charon started'; head -c 1 >/dev/null; echo 'flush failed' >&2; exit 4";
    let mut daemon = launch(options(dir.path(), script)).unwrap();
    match daemon.shutdown().unwrap_err() {
        HarnessError::UnexpectedExitCode { code, stderr } => {
            assert_eq!(code, Some(4));
            assert!(stderr.contains("flush failed"), "{stderr}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(daemon.exit_code(), Some(4));
}

#[test]
fn test_operations_after_exit_are_invalid_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut daemon = launch(options(dir.path(), WELL_BEHAVED)).unwrap();
    daemon.shutdown().unwrap();
    assert!(matches!(
        daemon.await_operations(1),
        Err(HarnessError::InvalidState { .. })
    ));
    assert!(matches!(
        daemon.shutdown(),
        Err(HarnessError::InvalidState { .. })
    ));
}

#[test]
fn test_missing_binary_is_process_start_failure() {
    let dir = tempfile::tempdir().unwrap();
    let opts = LaunchOptions::new(
        DaemonCommand::new(dir.path().join("no-such-daemon")),
        dir.path().join("charon_config.json"),
        dir.path().join("charon_log.txt"),
    );
    let error = launch(opts).err().unwrap();
    assert_eq!(error.code(), "PROCESS_START_FAILED");
}

// ---------------------------------------------------------------------------
// Runner with a fake daemon
// ---------------------------------------------------------------------------

fn runner(base: &Path, script: &str) -> ScenarioRunner {
    let mut settings = HarnessSettings::default();
    settings.sandbox_base = base.join("sandboxes");
    settings.log_dir = base.join("logs");
    settings.shutdown_timeout = Duration::from_secs(2);
    ScenarioRunner::new(settings).with_command(fake_daemon(script))
}

#[test]
fn test_do_nothing_passes_against_idle_daemon() {
    let base = tempfile::tempdir().unwrap();
    let script = "echo 'Charon started'; head -c 1 >/dev/null; exit 0";
    let case = scenarios::find("do_nothing").unwrap();
    let outcome = runner(base.path(), script).run_case(case);
    assert!(outcome.passed, "{:?}", outcome.error);
    assert_eq!(outcome.operations_observed, 0);
}

#[test]
fn test_runner_reports_daemon_that_never_starts() {
    let base = tempfile::tempdir().unwrap();
    let case = scenarios::find("copy_one_file").unwrap();
    let outcome = runner(base.path(), "exit 1").run_case(case);
    assert!(!outcome.passed);
    assert_eq!(outcome.error_code.as_deref(), Some("UNEXPECTED_EXIT_CODE"));
}

#[test]
fn test_runner_shuts_down_daemon_left_running() {
    let base = tempfile::tempdir().unwrap();
    let script = "echo 'Charon started'; head -c 1 >/dev/null; exit 0";
    let outcome = runner(base.path(), script).run("left running", |ctx| {
        ctx.launch(&ActionConfig::new())?;
        ctx.check(ctx.oracle().read_file("charon_config.json")?.is_some(), "config written")
    });
    assert!(outcome.passed, "{:?}", outcome.error);
}
