//! Logging setup.
//!
//! The daemon child writes to `~/.bore/bore.log` through a non-blocking
//! appender; everything else logs to stderr. `RUST_LOG` overrides the
//! CLI-supplied level in both modes.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::paths::Paths;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Stderr logging for foreground use.
pub fn init_foreground(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Append-only file logging for the daemon child. The returned guard must
/// live as long as the process; dropping it flushes the writer.
pub fn init_daemon(paths: &Paths, level: &str) -> WorkerGuard {
    let appender = tracing_appender::rolling::never(paths.base(), crate::paths::LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter(level))
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .init();

    guard
}
