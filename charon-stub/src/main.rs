//! Charon daemon double.
//!
//! Watches the folders named in an action config and runs each watcher's
//! action chain on files that become ready. Prints `Charon started` once
//! watching, `Operation succeeded` after each completed action, and exits 0
//! after reading `q` (or EOF) on stdin.

mod processor;
mod watcher;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use charon_harness::ActionConfig;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::processor::Processor;
use crate::watcher::FolderWatcher;

#[derive(Parser)]
#[command(name = "charon-stub")]
#[command(author, version, about = "Folder-automation daemon double")]
struct Cli {
    /// JSON action config
    #[arg(long)]
    config: PathBuf,

    /// File receiving a copy of the log
    #[arg(long)]
    log: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log.as_deref())?;

    let config = ActionConfig::read_from(&cli.config)
        .with_context(|| format!("Failed to read config {}", cli.config.display()))?;
    config.validate().context("Invalid config")?;

    let folders = config.watched_folders();
    for folder in &folders {
        std::fs::create_dir_all(folder)
            .with_context(|| format!("Failed to create watched folder {}", folder.display()))?;
    }
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
    let _watcher = FolderWatcher::start(&folders, ready_tx).context("Failed to start watching")?;
    let mut quit_rx = spawn_quit_listener()?;
    let processor = Processor::new(config);

    info!("Charon started");

    loop {
        tokio::select! {
            biased;

            Some(path) = ready_rx.recv() => {
                debug!(file = %path.display(), "file ready");
                processor.handle(&path).await;
            }

            reason = quit_rx.recv() => {
                debug!(reason = reason.unwrap_or("listener gone"), "quitting");
                break;
            }
        }
    }

    info!("Charon stopped");
    Ok(())
}

fn init_logging(verbose: bool, log_path: Option<&Path>) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::new(format!("charon_stub={level}"));

    let file_layer = match log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("Failed to create log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_ansi(false)
                .with_target(false),
        )
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")
}

/// Read stdin on a dedicated thread; resolves on `q` or EOF.
fn spawn_quit_listener() -> Result<mpsc::UnboundedReceiver<&'static str>> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::Builder::new()
        .name("charon-stdin".to_string())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut byte = [0u8; 1];
            let reason = loop {
                match stdin.read(&mut byte) {
                    Ok(0) => break "eof",
                    Ok(_) if byte[0] == b'q' => break "quit command",
                    Ok(_) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(_) => break "stdin error",
                }
            };
            let _ = tx.send(reason);
        })
        .context("Failed to spawn stdin listener")?;
    Ok(rx)
}
