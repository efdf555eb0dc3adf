//! Global `tracing` subscriber setup for tests and the CLI.

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install the test subscriber. Safe to call from every test.
///
/// Events go to `target/test-logs/all_tests.jsonl` as JSON and to the test
/// writer in compact form. The level comes from `CHARON_TEST_LOG_LEVEL`
/// (default `info`).
///
/// ```ignore
/// #[ctor::ctor]
/// fn setup() {
///     charon_harness::init_test_logging();
/// }
/// ```
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let file_layer = create_test_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
        });

        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .with_level(true)
            .compact();

        let level = std::env::var("CHARON_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = EnvFilter::try_new(crate_directives(&level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(test_layer);

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Install the CLI subscriber: human-readable output on stderr, `debug` for
/// this workspace's crates when `verbose`, otherwise `RUST_LOG` or `info`.
pub fn init_cli_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(crate_directives("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn crate_directives(level: &str) -> String {
    format!("charon_harness={level},charon_accept={level},charon_stub={level},acceptance_e2e={level}")
}

fn create_test_log_file() -> Option<std::fs::File> {
    if let Ok(custom) = std::env::var("CHARON_TEST_LOG_FILE") {
        let path = PathBuf::from(custom);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        return std::fs::File::create(path).ok();
    }

    let log_dir = crate::settings::cargo_target_dir().join("test-logs");
    let _ = std::fs::create_dir_all(&log_dir);
    std::fs::File::create(log_dir.join("all_tests.jsonl")).ok()
}
