//! Diagnostic logging: an EnvFilter-driven subscriber writing to a
//! rotating `service.log` in the working directory.

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "service.log";

/// Keep this alive for the lifetime of the process; dropping it flushes
/// and stops the background log writer.
pub struct LoggingGuard {
    _file: WorkerGuard,
}

/// Install the global subscriber. `SENTRA_LOG` selects the level
/// (default `info`); `RUST_LOG` wins when set.
pub fn init(directory: &Path) -> LoggingGuard {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var("SENTRA_LOG").unwrap_or_else(|_| "info".to_string());
        EnvFilter::new(level)
    };

    let appender = tracing_appender::rolling::daily(directory, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .finish();

    // Already-initialized only happens in tests; keep the existing one.
    let _ = tracing::subscriber::set_global_default(subscriber);

    LoggingGuard { _file: guard }
}
