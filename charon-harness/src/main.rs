//! Charon acceptance runner.
//!
//! Runs the scenario catalog against a Charon daemon binary and exits
//! non-zero when any scenario fails.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use charon_harness::settings::parse_duration;
use charon_harness::{
    ConfigSource, HarnessSettings, RunSummary, ScenarioRunner, Setting, init_cli_logging, scenarios,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "charon-accept")]
#[command(author, version, about = "Acceptance scenarios for the Charon daemon")]
struct Cli {
    /// Parent directory for per-scenario sandboxes
    sandbox_dir: Option<PathBuf>,

    /// Daemon binary under test
    daemon_binary: Option<PathBuf>,

    /// TOML settings file
    #[arg(long, env = "CHARON_SETTINGS")]
    settings: Option<PathBuf>,

    /// Only run scenarios whose name contains this text (repeatable)
    #[arg(short, long)]
    filter: Vec<String>,

    /// List scenarios and exit
    #[arg(long)]
    list: bool,

    /// Time allowed for the startup marker (e.g. "10s")
    #[arg(long, value_parser = duration_arg)]
    startup_timeout: Option<Duration>,

    /// Time allowed for each batch of operation markers
    #[arg(long, value_parser = duration_arg)]
    operation_timeout: Option<Duration>,

    /// Time allowed for the daemon to exit after quit
    #[arg(long, value_parser = duration_arg)]
    shutdown_timeout: Option<Duration>,

    /// Keep sandboxes of failed scenarios for inspection
    #[arg(long)]
    keep_sandbox: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn duration_arg(value: &str) -> Result<Duration, String> {
    parse_duration(value).ok_or_else(|| format!("invalid duration '{value}'"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_cli_logging(cli.verbose);

    let selected = scenarios::select(&cli.filter);
    if cli.list {
        for case in &selected {
            println!("{:<28} {}", case.name, case.description);
        }
        return Ok(());
    }
    if selected.is_empty() {
        anyhow::bail!("no scenario matches {:?}", cli.filter);
    }

    let mut settings = HarnessSettings::load(cli.settings.as_deref()).context("Failed to load harness settings")?;
    apply_cli(&mut settings, &cli);
    if !settings.daemon_binary.is_file() {
        anyhow::bail!("daemon binary not found at {}", settings.daemon_binary.display());
    }

    info!(
        daemon = %settings.daemon_binary.display(),
        sandbox = %settings.sandbox_base.display(),
        scenarios = selected.len(),
        "Running acceptance scenarios"
    );
    let summary = ScenarioRunner::new(settings).run_all(selected);

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("Failed to serialize run summary")?
        );
    } else {
        print_summary(&summary);
    }

    if !summary.all_passed() {
        std::process::exit(1);
    }
    Ok(())
}

fn apply_cli(settings: &mut HarnessSettings, cli: &Cli) {
    let overrides = [
        cli.sandbox_dir.clone().map(Setting::SandboxBase),
        cli.daemon_binary.clone().map(Setting::DaemonBinary),
        cli.startup_timeout.map(Setting::StartupTimeout),
        cli.operation_timeout.map(Setting::OperationTimeout),
        cli.shutdown_timeout.map(Setting::ShutdownTimeout),
        cli.keep_sandbox.then_some(Setting::KeepSandboxOnFailure(true)),
    ];
    for setting in overrides.into_iter().flatten() {
        settings.set(setting, ConfigSource::CommandLine);
    }
}

fn print_summary(summary: &RunSummary) {
    for outcome in &summary.outcomes {
        let status = if outcome.passed { "PASS" } else { "FAIL" };
        println!("{status}  {:<28} {:>6} ms", outcome.name, outcome.duration_ms);
        if let Some(error) = &outcome.error {
            println!("      {error}");
        }
        if let Some(sandbox) = &outcome.sandbox {
            println!("      sandbox kept at {}", sandbox.display());
        }
        if let (false, Some(log)) = (outcome.passed, &outcome.log_path) {
            println!("      log: {}", log.display());
        }
    }
    println!(
        "\n{} passed, {} failed, {} total ({} ms)",
        summary.passed, summary.failed, summary.total, summary.duration_ms
    );
}
