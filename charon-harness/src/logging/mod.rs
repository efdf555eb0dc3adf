//! Scenario logging.
//!
//! Every scenario gets a [`ScenarioLog`]: entries are forwarded to `tracing`,
//! kept in a bounded in-memory ring for assertions and summaries, and
//! appended as JSONL to `<log_dir>/<scenario>_<timestamp>.jsonl`. Phase
//! events (setup, execute, verify, cleanup) carry a decision code and go to a
//! separate `phases_*.jsonl` file. Artifacts (daemon transcript, stderr,
//! configuration) are written under `<log_dir>/artifacts/<scenario>/`.

mod subscriber;

pub use subscriber::{init_cli_logging, init_test_logging};

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every phase event.
pub const PHASE_EVENT_SCHEMA_VERSION: &str = "1.0.0";

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

/// Source of a log entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// The harness itself
    Harness,
    /// A line read from the daemon's stdout
    DaemonStdout,
    /// A line read from the daemon's stderr
    DaemonStderr,
    /// Filesystem checks
    Oracle,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Harness => write!(f, "harness"),
            LogSource::DaemonStdout => write!(f, "daemon:stdout"),
            LogSource::DaemonStderr => write!(f, "daemon:stderr"),
            LogSource::Oracle => write!(f, "oracle"),
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    /// Elapsed time since the scenario started
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub context: Vec<(String, String)>,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:>6}ms] [{:<5}] [{}] {}",
            self.elapsed_ms, self.level, self.source, self.message
        )?;
        if !self.context.is_empty() {
            write!(f, " {{{}}}", format_context(&self.context))?;
        }
        Ok(())
    }
}

fn format_context(context: &[(String, String)]) -> String {
    context
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Lifecycle phase of a scenario.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Setup,
    Execute,
    Verify,
    Cleanup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Setup => "setup",
            Self::Execute => "execute",
            Self::Verify => "verify",
            Self::Cleanup => "cleanup",
        };
        write!(f, "{phase}")
    }
}

/// Machine-readable phase event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseEvent {
    pub schema_version: String,
    pub timestamp: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub level: LogLevel,
    pub phase: Phase,
    pub scenario: String,
    pub message: String,
    pub decision_code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_paths: Vec<String>,
}

/// Configuration for a scenario log
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level to capture
    pub min_level: LogLevel,
    /// Maximum number of entries kept in memory (0 = unlimited)
    pub max_entries: usize,
    /// Directory for JSONL files and artifacts; `None` keeps everything in memory
    pub log_dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            max_entries: 10_000,
            log_dir: None,
        }
    }
}

/// Thread-safe scenario log. Clones share the same storage.
#[derive(Clone)]
pub struct ScenarioLog {
    config: Arc<LogConfig>,
    entries: Arc<Mutex<VecDeque<LogEntry>>>,
    start_time: Instant,
    scenario: Arc<String>,
    file_writer: Arc<Mutex<Option<BufWriter<File>>>>,
    phase_writer: Arc<Mutex<Option<BufWriter<File>>>>,
    log_path: Arc<Option<PathBuf>>,
    artifact_root: Arc<Option<PathBuf>>,
}

impl ScenarioLog {
    pub fn new(scenario: &str, config: LogConfig) -> Self {
        let mut file_writer = None;
        let mut phase_writer = None;
        let mut log_path = None;
        let mut artifact_root = None;

        if let Some(dir) = config.log_dir.as_deref() {
            match fs::create_dir_all(dir) {
                Ok(()) => {
                    let stem = sanitize_component(scenario);
                    let timestamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");

                    let path = dir.join(format!("{stem}_{timestamp}.jsonl"));
                    match File::create(&path) {
                        Ok(file) => {
                            file_writer = Some(BufWriter::new(file));
                            log_path = Some(path);
                        }
                        Err(error) => tracing::warn!(
                            path = %path.display(),
                            %error,
                            "failed to create scenario log file"
                        ),
                    }

                    let phases = dir.join(format!("phases_{stem}_{timestamp}.jsonl"));
                    match File::create(&phases) {
                        Ok(file) => phase_writer = Some(BufWriter::new(file)),
                        Err(error) => tracing::warn!(
                            path = %phases.display(),
                            %error,
                            "failed to create phase log file"
                        ),
                    }

                    let artifacts = dir.join("artifacts");
                    if fs::create_dir_all(&artifacts).is_ok() {
                        artifact_root = Some(artifacts);
                    }
                }
                Err(error) => tracing::warn!(
                    dir = %dir.display(),
                    %error,
                    "failed to create log directory; keeping scenario log in memory"
                ),
            }
        }

        Self {
            config: Arc::new(config),
            entries: Arc::new(Mutex::new(VecDeque::new())),
            start_time: Instant::now(),
            scenario: Arc::new(scenario.to_string()),
            file_writer: Arc::new(Mutex::new(file_writer)),
            phase_writer: Arc::new(Mutex::new(phase_writer)),
            log_path: Arc::new(log_path),
            artifact_root: Arc::new(artifact_root),
        }
    }

    /// A log that never touches the filesystem.
    pub fn in_memory(scenario: &str) -> Self {
        Self::new(scenario, LogConfig::default())
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Path of the JSONL entry file, if one was created.
    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn log(&self, level: LogLevel, source: LogSource, message: impl Into<String>) {
        self.log_with_context(level, source, message, Vec::new());
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        source: LogSource,
        message: impl Into<String>,
        context: Vec<(String, String)>,
    ) {
        if level < self.config.min_level {
            return;
        }

        let entry = LogEntry {
            timestamp: Utc::now(),
            elapsed_ms: self.elapsed_ms(),
            level,
            source,
            message: message.into(),
            context,
        };

        self.forward_to_tracing(&entry);

        if let Some(writer) = lock(&self.file_writer).as_mut()
            && let Ok(json) = serde_json::to_string(&entry)
        {
            let _ = writeln!(writer, "{json}");
            let _ = writer.flush();
        }

        let mut entries = lock(&self.entries);
        entries.push_back(entry);
        if self.config.max_entries > 0 && entries.len() > self.config.max_entries {
            entries.pop_front();
        }
    }

    fn forward_to_tracing(&self, entry: &LogEntry) {
        let scenario = self.scenario.as_str();
        let source = &entry.source;
        let context = format_context(&entry.context);
        match entry.level {
            LogLevel::Trace => {
                tracing::trace!(scenario, %source, context = %context, "{}", entry.message)
            }
            LogLevel::Debug => {
                tracing::debug!(scenario, %source, context = %context, "{}", entry.message)
            }
            LogLevel::Info => tracing::info!(scenario, %source, context = %context, "{}", entry.message),
            LogLevel::Warn => tracing::warn!(scenario, %source, context = %context, "{}", entry.message),
            LogLevel::Error => {
                tracing::error!(scenario, %source, context = %context, "{}", entry.message)
            }
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    /// Record a phase transition with the decision taken in it.
    pub fn phase(
        &self,
        phase: Phase,
        message: impl Into<String>,
        decision_code: impl Into<String>,
    ) -> PhaseEvent {
        self.phase_with_artifacts(phase, LogLevel::Info, message, decision_code, Vec::new())
    }

    pub fn phase_with_artifacts(
        &self,
        phase: Phase,
        level: LogLevel,
        message: impl Into<String>,
        decision_code: impl Into<String>,
        artifact_paths: Vec<String>,
    ) -> PhaseEvent {
        let event = PhaseEvent {
            schema_version: PHASE_EVENT_SCHEMA_VERSION.to_string(),
            timestamp: Utc::now(),
            elapsed_ms: self.elapsed_ms(),
            level,
            phase,
            scenario: self.scenario.to_string(),
            message: message.into(),
            decision_code: decision_code.into(),
            artifact_paths,
        };

        let mut context = vec![
            ("phase".to_string(), event.phase.to_string()),
            ("decision_code".to_string(), event.decision_code.clone()),
        ];
        if !event.artifact_paths.is_empty() {
            context.push(("artifact_paths".to_string(), event.artifact_paths.join(",")));
        }
        self.log_with_context(
            event.level,
            LogSource::Harness,
            format!("[{}] {}", event.phase, event.message),
            context,
        );

        if let Some(writer) = lock(&self.phase_writer).as_mut()
            && let Ok(json) = serde_json::to_string(&event)
        {
            let _ = writeln!(writer, "{json}");
            let _ = writer.flush();
        }

        event
    }

    /// Persist a text artifact. Fails if the log has no directory.
    pub fn capture_artifact_text(&self, name: &str, content: &str) -> std::io::Result<PathBuf> {
        let path = self.artifact_path(name, "txt")?;
        fs::write(&path, content)?;
        Ok(path)
    }

    /// Persist a pretty-printed JSON artifact. Fails if the log has no directory.
    pub fn capture_artifact_json<T: Serialize>(
        &self,
        name: &str,
        value: &T,
    ) -> std::io::Result<PathBuf> {
        let serialized = serde_json::to_string_pretty(value).map_err(|error| {
            std::io::Error::other(format!("failed to serialize artifact json: {error}"))
        })?;
        let path = self.artifact_path(name, "json")?;
        fs::write(&path, serialized)?;
        Ok(path)
    }

    fn artifact_path(&self, name: &str, extension: &str) -> std::io::Result<PathBuf> {
        let Some(root) = self.artifact_root.as_deref() else {
            return Err(std::io::Error::other(
                "artifact capture requires a log directory",
            ));
        };
        let dir = root.join(sanitize_component(&self.scenario));
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{}.{extension}", sanitize_component(name))))
    }

    pub fn trace(&self, message: impl Into<String>) {
        self.log(LogLevel::Trace, LogSource::Harness, message);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, LogSource::Harness, message);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, LogSource::Harness, message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, LogSource::Harness, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, LogSource::Harness, message);
    }

    /// Record a line the daemon wrote to stdout.
    pub fn daemon_stdout(&self, line: impl Into<String>) {
        self.log(LogLevel::Debug, LogSource::DaemonStdout, line);
    }

    /// Record a line the daemon wrote to stderr.
    pub fn daemon_stderr(&self, line: impl Into<String>) {
        self.log(LogLevel::Warn, LogSource::DaemonStderr, line);
    }

    /// Record a filesystem check.
    pub fn oracle(&self, level: LogLevel, message: impl Into<String>) {
        self.log(level, LogSource::Oracle, message);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).iter().cloned().collect()
    }

    pub fn summary(&self) -> LogSummary {
        let entries = lock(&self.entries);
        let mut summary = LogSummary {
            scenario: self.scenario.to_string(),
            total_entries: entries.len(),
            duration_ms: self.elapsed_ms(),
            counts_by_level: BTreeMap::new(),
            first_error: None,
            last_error: None,
            log_path: (*self.log_path).clone(),
        };

        for entry in entries.iter() {
            *summary.counts_by_level.entry(entry.level).or_insert(0) += 1;
            if entry.level == LogLevel::Error {
                if summary.first_error.is_none() {
                    summary.first_error = Some(entry.message.clone());
                }
                summary.last_error = Some(entry.message.clone());
            }
        }

        summary
    }
}

/// Summary of a scenario log
#[derive(Debug, Clone, Serialize)]
pub struct LogSummary {
    pub scenario: String,
    pub total_entries: usize,
    pub duration_ms: u64,
    pub counts_by_level: BTreeMap<LogLevel, usize>,
    pub first_error: Option<String>,
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`.
pub(crate) fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_log(dir: &Path, name: &str) -> ScenarioLog {
        ScenarioLog::new(
            name,
            LogConfig {
                log_dir: Some(dir.to_path_buf()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_levels_are_ordered() {
        assert!(LogLevel::Trace < LogLevel::Debug);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn test_min_level_filters_entries() {
        let log = ScenarioLog::new(
            "filtering",
            LogConfig {
                min_level: LogLevel::Info,
                ..Default::default()
            },
        );
        log.trace("trace");
        log.debug("debug");
        log.daemon_stdout("Charon started");
        log.info("info");
        assert_eq!(log.entries().len(), 1);
    }

    #[test]
    fn test_ring_is_bounded() {
        let log = ScenarioLog::new(
            "ring",
            LogConfig {
                max_entries: 3,
                ..Default::default()
            },
        );
        for i in 0..5 {
            log.info(format!("entry {i}"));
        }
        let messages: Vec<_> = log.entries().into_iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["entry 2", "entry 3", "entry 4"]);
    }

    #[test]
    fn test_entries_keep_their_source() {
        let log = ScenarioLog::in_memory("sources");
        log.daemon_stdout("Charon started");
        log.daemon_stdout("Operation succeeded: copy");
        log.daemon_stderr("warning: slow disk");
        log.oracle(LogLevel::Info, "Dst holds 1 file");

        let sources: Vec<_> = log.entries().into_iter().map(|e| e.source).collect();
        assert_eq!(
            sources,
            vec![
                LogSource::DaemonStdout,
                LogSource::DaemonStdout,
                LogSource::DaemonStderr,
                LogSource::Oracle
            ]
        );
        assert!(log.entries()[2].to_string().contains("[daemon:stderr]"));
    }

    #[test]
    fn test_summary_tracks_errors() {
        let log = ScenarioLog::in_memory("summary");
        log.info("launch");
        log.error("first");
        log.warn("careful");
        log.error("second");

        let summary = log.summary();
        assert_eq!(summary.total_entries, 4);
        assert_eq!(summary.counts_by_level.get(&LogLevel::Error), Some(&2));
        assert_eq!(summary.first_error.as_deref(), Some("first"));
        assert_eq!(summary.last_error.as_deref(), Some("second"));
        assert!(summary.log_path.is_none());
    }

    #[test]
    fn test_jsonl_and_phase_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log(dir.path(), "copy_one_file");
        log.info("hello");
        let event = log.phase(Phase::Setup, "sandbox ready", "SANDBOX_CREATED");
        assert_eq!(event.schema_version, PHASE_EVENT_SCHEMA_VERSION);

        let path = log.log_path().unwrap().to_path_buf();
        let lines: Vec<LogEntry> = fs::read_to_string(&path)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].message, "[setup] sandbox ready");

        let phase_file = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .find(|e| e.file_name().to_string_lossy().starts_with("phases_"))
            .unwrap();
        let phase: PhaseEvent =
            serde_json::from_str(fs::read_to_string(phase_file.path()).unwrap().trim()).unwrap();
        assert_eq!(phase.decision_code, "SANDBOX_CREATED");
        assert_eq!(phase.phase, Phase::Setup);
    }

    #[test]
    fn test_artifacts_are_sanitized_and_scoped() {
        let dir = tempfile::tempdir().unwrap();
        let log = file_log(dir.path(), "name counters/ź");
        let text = log.capture_artifact_text("daemon stdout", "Charon started\n").unwrap();
        assert!(text.ends_with("artifacts/name_counters__/daemon_stdout.txt"));
        let json = log
            .capture_artifact_json("config", &serde_json::json!([]))
            .unwrap();
        assert_eq!(fs::read_to_string(json).unwrap(), "[]");
    }

    #[test]
    fn test_in_memory_log_rejects_artifacts() {
        let log = ScenarioLog::in_memory("memory");
        assert!(log.capture_artifact_text("x", "y").is_err());
    }
}
