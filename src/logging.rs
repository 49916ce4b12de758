//! Structured logging initialization (ambient stack, §1/§9).
//!
//! The runtime is linked into a host process as a `staticlib`/`lib`, so it
//! cannot assume it owns `main` — the process-wide logger sink is one of the
//! few pieces of global state this crate installs deliberately (§9 "Process-
//! wide state is avoided except for the monotonic clock and logger sink").
//! [`init`] mirrors the `EnvFilter` + `fmt` layer setup used by this
//! project's own CLI/host-bridge entry points, with an optional
//! daily-rotating file sink layered in via `tracing-appender` when a log
//! directory is configured.

use std::path::Path;

use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{fmt, EnvFilter};

/// Held for the process lifetime; dropping it stops flushing the
/// non-blocking file writer. `None` when no log directory was configured.
#[must_use]
pub struct LoggingGuard(Option<tracing_appender::non_blocking::WorkerGuard>);

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global `tracing` subscriber: always to stderr, plus a
/// daily-rotating file sink under `log_dir` when one is given. `RUST_LOG`
/// overrides the default `info` filter.
///
/// Safe to call more than once per process — a second call's `try_init`
/// failure (the global subscriber can only be set once) is swallowed rather
/// than panicking, since an embedding host may already have installed its
/// own subscriber before loading this library.
pub fn init(log_dir: Option<&Path>) -> LoggingGuard {
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            if let Err(e) = std::fs::create_dir_all(dir) {
                // Fall back to stderr-only logging rather than failing
                // startup over a log directory that can't be created.
                let _ = tracing_subscriber::registry()
                    .with(env_filter())
                    .with(stderr_layer)
                    .try_init();
                eprintln!("logging: could not create log dir {}: {e}", dir.display());
                return LoggingGuard(None);
            }
            let appender = tracing_appender::rolling::daily(dir, "localvox.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .with(file_layer)
                .try_init();
            LoggingGuard(Some(guard))
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(stderr_layer)
                .try_init();
            LoggingGuard(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_without_log_dir_does_not_panic() {
        let _guard = init(None);
    }

    #[test]
    fn init_with_log_dir_creates_it() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_dir = dir.path().join("logs");
        let _guard = init(Some(&log_dir));
        assert!(log_dir.exists());
    }
}
