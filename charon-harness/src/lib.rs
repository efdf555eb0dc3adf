//! Black-box acceptance harness for the Charon folder-automation daemon.
//!
//! The harness owns a disposable sandbox per scenario, writes the daemon's
//! JSON action config, drives the daemon as a child process through its
//! stdout markers and stdin quit command, and checks the resulting file
//! tree with [`FixtureOracle`].
//!
//! ```ignore
//! use charon_harness::{HarnessSettings, ScenarioRunner, scenarios};
//!
//! let runner = ScenarioRunner::new(HarnessSettings::load(None)?);
//! let summary = runner.run_all(scenarios::catalog());
//! assert!(summary.all_passed());
//! ```

pub mod action_config;
pub mod error;
pub mod fixtures;
pub mod logging;
pub mod process;
pub mod sandbox;
pub mod scenario;
pub mod scenarios;
pub mod settings;
pub mod template;

pub use action_config::{Action, ActionConfig, Transfer, WatcherConfig};
pub use error::{HarnessError, HarnessResult};
pub use fixtures::{FileFixture, FixtureOracle, generate_content, generate_name};
pub use logging::{
    LogConfig, LogEntry, LogLevel, LogSource, Phase, PhaseEvent, ScenarioLog, init_cli_logging,
    init_test_logging,
};
pub use process::{
    DaemonCommand, DaemonController, DaemonState, LaunchOptions, OPERATION_MARKER, STARTUP_MARKER,
    ShutdownReport,
};
pub use sandbox::Sandbox;
pub use scenario::{RunSummary, ScenarioContext, ScenarioOutcome, ScenarioRunner};
pub use scenarios::ScenarioCase;
pub use settings::{ConfigSource, HarnessSettings, Setting};
pub use template::{NameTemplate, RenderInput, TemplateError};
