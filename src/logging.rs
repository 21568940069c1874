//! Logging initialisation for labwarden.
//!
//! When the `LABWARDEN_LOG` environment variable is set to `1`, structured
//! logs are additionally written to `labwarden.log` in the configured log
//! directory. Stderr output (filtered by `RUST_LOG`) is always enabled.
//!
//! Returns a guard that must be kept alive for the duration of the process
//! so that buffered log lines are flushed on exit.

use std::path::Path;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initialise the global tracing subscriber.
///
/// Call once from `main`, store the returned `LogGuard` in a local variable
/// for the duration of the process.
pub fn init(log_dir: &Path) -> LogGuard {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_guard = if std::env::var("LABWARDEN_LOG").as_deref() == Ok("1") {
        let dir = if std::fs::create_dir_all(log_dir).is_ok() {
            log_dir.to_path_buf()
        } else {
            std::env::temp_dir()
        };
        let file_appender = tracing_appender::rolling::never(dir, "labwarden.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(filter())
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();

        None
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
