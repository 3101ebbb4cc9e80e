//! Tracing setup (§9.2), extracted from the teacher's `main.rs`.
//!
//! Master secrets and derived keys are never interpolated into log lines —
//! every pairing module logs a device id or session id at most, never the
//! bytes themselves.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initializes the tracing subscriber. If `log_file` is set, logs go to
/// both stdout and a daily-rolling file. Returns a `WorkerGuard` that must
/// stay alive for the process lifetime.
///
/// If the log directory cannot be created, falls back to stdout-only
/// logging with a warning — never panics.
pub fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("pair-daemon.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}
