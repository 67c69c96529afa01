//! Structured test logging.
//!
//! Call [`init_test_logging`] at the top of a test; it is safe to call from
//! every test. Output goes to the test writer so `cargo test` captures it per
//! test, and optionally to a JSONL file for CI debugging.
//!
//! # Environment Variables
//!
//! - `STEPGUARD_TEST_LOG_FILE`: also write JSONL events to this path
//! - `STEPGUARD_TEST_LOG_LEVEL`: level filter (default: `info`)

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;

static TEST_LOGGING_INIT: Once = Once::new();

/// Install the global test subscriber once per process.
pub fn init_test_logging() {
    TEST_LOGGING_INIT.call_once(|| {
        let file_layer = open_log_file().map(|file| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(Mutex::new(file))
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(true)
        });

        let test_layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_target(true)
            .compact();

        let level = std::env::var("STEPGUARD_TEST_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let filter = EnvFilter::try_new(format!(
            "stepguard={level},stepguard_common={level},stepguardd={level}"
        ))
        .unwrap_or_else(|_| EnvFilter::new("info"));

        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(test_layer);

        // Another subscriber may already be installed by the test binary.
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

fn open_log_file() -> Option<std::fs::File> {
    let path = PathBuf::from(std::env::var("STEPGUARD_TEST_LOG_FILE").ok()?);
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .ok()
}

/// Log a test progress line with the test name attached.
///
/// ```ignore
/// test_log!("happy_path", "node listening on {}", addr);
/// ```
#[macro_export]
macro_rules! test_log {
    ($test:expr, $($arg:tt)+) => {
        ::tracing::info!(test = $test, $($arg)+)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_test_logging();
        init_test_logging();
        crate::test_log!("test_init_is_idempotent", "logging initialised {} times", 2);
    }
}
