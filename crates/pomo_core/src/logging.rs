use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::paths;

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,pomo_network=debug,pomo_app=debug";

/// Prefix of the daily log files.
const LOG_FILE_PREFIX: &str = "pomo";

/// Initializes logging to `~/.pomo/logs`.
/// Returns a guard that must be kept alive for the duration of the app.
///
/// Logs go to the file only; the terminal belongs to the member list.
pub fn init_logging() -> Result<WorkerGuard> {
    let logs_dir = paths::logs_dir()?;
    init_logging_to_dir(&logs_dir, DEFAULT_FILTER)
}

/// Initialize logging to a custom directory with a custom filter.
/// `RUST_LOG` still takes precedence over `filter`.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    paths::ensure_dir(logs_dir)?;

    // File appender: daily rotation
    let file_appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_to_dir_creates_directory() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // Only one global subscriber per process; a second init in another
        // test returns an error but the directory is still created.
        let result = init_logging_to_dir(&logs_dir, "warn");
        assert!(logs_dir.exists());

        match result {
            Ok(guard) => drop(guard),
            Err(e) => assert!(
                e.to_string().contains("logging"),
                "unexpected error: {e}"
            ),
        }
    }

    #[test]
    fn test_init_logging_to_dir_rejects_file_path() {
        let tmp = tempfile::tempdir().expect("Failed to create tempdir");
        let file = tmp.path().join("not-a-dir");
        std::fs::write(&file, "x").unwrap();
        assert!(init_logging_to_dir(&file, "info").is_err());
    }

    #[test]
    fn test_default_filter_parses() {
        for f in [DEFAULT_FILTER, "warn", "pomo_network=trace,info"] {
            assert!(EnvFilter::try_new(f).is_ok(), "{f}");
        }
    }
}
