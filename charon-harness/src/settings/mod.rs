//! Layered harness settings.
//!
//! Values are resolved from, in increasing precedence:
//! - built-in defaults
//! - an optional TOML settings file (durations in `humantime` syntax)
//! - `CHARON_*` environment variables
//! - command-line flags, applied by the caller through [`HarnessSettings::set`]

pub mod env;
pub mod source;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use env::{EnvError, EnvParser, parse_duration};
pub use source::{ConfigSource, Sourced};

use crate::error::{HarnessError, HarnessResult};

/// Default time allowed for the startup marker.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default time allowed for one `await_operations` barrier.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time allowed for the daemon to exit after `q`.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved harness settings.
#[derive(Debug, Clone, Serialize)]
pub struct HarnessSettings {
    pub daemon_binary: PathBuf,
    /// Parent directory for per-scenario sandbox roots.
    pub sandbox_base: PathBuf,
    /// Directory for JSONL scenario logs and artifacts.
    pub log_dir: PathBuf,
    #[serde(with = "humantime_str")]
    pub startup_timeout: Duration,
    #[serde(with = "humantime_str")]
    pub operation_timeout: Duration,
    #[serde(with = "humantime_str")]
    pub shutdown_timeout: Duration,
    pub keep_sandbox_on_failure: bool,
    /// Pass `--verbose` to the daemon.
    pub daemon_verbose: bool,
    /// Which layer supplied each field.
    pub origins: BTreeMap<&'static str, ConfigSource>,
}

/// On-disk shape of a settings file.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettingsFile {
    pub daemon_binary: Option<PathBuf>,
    pub sandbox_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub startup_timeout: Option<String>,
    pub operation_timeout: Option<String>,
    pub shutdown_timeout: Option<String>,
    pub keep_sandbox: Option<bool>,
    pub daemon_verbose: Option<bool>,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        let target_dir = cargo_target_dir();
        let origins = FIELDS
            .iter()
            .map(|field| (*field, ConfigSource::Default))
            .collect();

        Self {
            daemon_binary: default_daemon_binary(&target_dir),
            sandbox_base: std::env::temp_dir().join("charon_acceptance"),
            log_dir: target_dir.join("test-logs"),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            keep_sandbox_on_failure: false,
            daemon_verbose: true,
            origins,
        }
    }
}

const FIELDS: [&str; 8] = [
    "daemon_binary",
    "sandbox_base",
    "log_dir",
    "startup_timeout",
    "operation_timeout",
    "shutdown_timeout",
    "keep_sandbox_on_failure",
    "daemon_verbose",
];

/// One override applied through [`HarnessSettings::set`].
#[derive(Debug, Clone)]
pub enum Setting {
    DaemonBinary(PathBuf),
    SandboxBase(PathBuf),
    LogDir(PathBuf),
    StartupTimeout(Duration),
    OperationTimeout(Duration),
    ShutdownTimeout(Duration),
    KeepSandboxOnFailure(bool),
    DaemonVerbose(bool),
}

impl HarnessSettings {
    /// Defaults, then `file` if given, then the environment.
    pub fn load(file: Option<&Path>) -> HarnessResult<Self> {
        let mut settings = Self::default();
        if let Some(path) = file {
            settings.apply_file(path)?;
        }
        settings.apply_env()?;
        Ok(settings)
    }

    /// Apply an override and record its source.
    pub fn set(&mut self, setting: Setting, source: ConfigSource) {
        let field = match setting {
            Setting::DaemonBinary(path) => {
                self.daemon_binary = path;
                "daemon_binary"
            }
            Setting::SandboxBase(path) => {
                self.sandbox_base = path;
                "sandbox_base"
            }
            Setting::LogDir(path) => {
                self.log_dir = path;
                "log_dir"
            }
            Setting::StartupTimeout(timeout) => {
                self.startup_timeout = timeout;
                "startup_timeout"
            }
            Setting::OperationTimeout(timeout) => {
                self.operation_timeout = timeout;
                "operation_timeout"
            }
            Setting::ShutdownTimeout(timeout) => {
                self.shutdown_timeout = timeout;
                "shutdown_timeout"
            }
            Setting::KeepSandboxOnFailure(keep) => {
                self.keep_sandbox_on_failure = keep;
                "keep_sandbox_on_failure"
            }
            Setting::DaemonVerbose(verbose) => {
                self.daemon_verbose = verbose;
                "daemon_verbose"
            }
        };
        self.origins.insert(field, source);
    }

    pub fn source_of(&self, field: &str) -> ConfigSource {
        self.origins
            .get(field)
            .copied()
            .unwrap_or(ConfigSource::Default)
    }

    /// Merge a TOML settings file.
    pub fn apply_file(&mut self, path: &Path) -> HarnessResult<()> {
        let invalid = |message: String| {
            HarnessError::Settings(vec![EnvError::InvalidFile {
                path: path.to_path_buf(),
                message,
            }])
        };
        let text = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        let file: SettingsFile = toml::from_str(&text).map_err(|e| invalid(e.to_string()))?;
        self.apply_settings_file(file, path)
    }

    fn apply_settings_file(&mut self, file: SettingsFile, path: &Path) -> HarnessResult<()> {
        let mut errors = Vec::new();
        let mut duration = |key: &str, raw: Option<String>| -> Option<Duration> {
            let raw = raw?;
            let parsed = env::parse_duration(&raw);
            if parsed.is_none() {
                errors.push(EnvError::InvalidDuration {
                    var: format!("{}:{key}", path.display()),
                    value: raw,
                });
            }
            parsed
        };

        let startup = duration("startup_timeout", file.startup_timeout);
        let operation = duration("operation_timeout", file.operation_timeout);
        let shutdown = duration("shutdown_timeout", file.shutdown_timeout);
        if !errors.is_empty() {
            return Err(HarnessError::Settings(errors));
        }

        let updates = [
            file.daemon_binary.map(Setting::DaemonBinary),
            file.sandbox_dir.map(Setting::SandboxBase),
            file.log_dir.map(Setting::LogDir),
            startup.map(Setting::StartupTimeout),
            operation.map(Setting::OperationTimeout),
            shutdown.map(Setting::ShutdownTimeout),
            file.keep_sandbox.map(Setting::KeepSandboxOnFailure),
            file.daemon_verbose.map(Setting::DaemonVerbose),
        ];
        for setting in updates.into_iter().flatten() {
            self.set(setting, ConfigSource::File);
        }
        Ok(())
    }

    /// Merge `CHARON_*` environment variables, reporting every invalid one.
    pub fn apply_env(&mut self) -> HarnessResult<()> {
        let mut parser = EnvParser::new();

        let binary = parser.get_path("DAEMON_BINARY", &self.daemon_binary, false);
        let sandbox = parser.get_path("SANDBOX_DIR", &self.sandbox_base, false);
        let log_dir = parser.get_path("LOG_DIR", &self.log_dir, false);
        let startup = parser.get_duration("STARTUP_TIMEOUT", self.startup_timeout);
        let operation = parser.get_duration("OPERATION_TIMEOUT", self.operation_timeout);
        let shutdown = parser.get_duration("SHUTDOWN_TIMEOUT", self.shutdown_timeout);
        let keep = parser.get_bool("KEEP_SANDBOX", self.keep_sandbox_on_failure);
        let verbose = parser.get_bool("DAEMON_VERBOSE", self.daemon_verbose);

        if parser.has_errors() {
            return Err(HarnessError::Settings(parser.take_errors()));
        }

        let updates = [
            binary.is_from_env().then(|| Setting::DaemonBinary(binary.value)),
            sandbox.is_from_env().then(|| Setting::SandboxBase(sandbox.value)),
            log_dir.is_from_env().then(|| Setting::LogDir(log_dir.value)),
            startup.is_from_env().then_some(Setting::StartupTimeout(startup.value)),
            operation.is_from_env().then_some(Setting::OperationTimeout(operation.value)),
            shutdown.is_from_env().then_some(Setting::ShutdownTimeout(shutdown.value)),
            keep.is_from_env().then_some(Setting::KeepSandboxOnFailure(keep.value)),
            verbose.is_from_env().then_some(Setting::DaemonVerbose(verbose.value)),
        ];
        for setting in updates.into_iter().flatten() {
            self.set(setting, ConfigSource::Environment);
        }
        Ok(())
    }
}

/// The cargo target directory for this workspace.
pub(crate) fn cargo_target_dir() -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(env!("CARGO_MANIFEST_DIR")));
    let workspace_root = manifest_dir
        .parent()
        .unwrap_or(manifest_dir.as_path())
        .to_path_buf();
    let target = std::env::var("CARGO_TARGET_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| workspace_root.join("target"));
    if target.is_absolute() {
        target
    } else {
        workspace_root.join(target)
    }
}

fn default_daemon_binary(target_dir: &Path) -> PathBuf {
    if let Ok(value) = std::env::var("CARGO_BIN_EXE_charon") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    let profile = if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    };
    target_dir.join(profile).join("charon")
}

mod humantime_str {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }
}

#[cfg(test)]
pub(crate) fn env_test_lock() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}
