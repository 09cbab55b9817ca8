//! Logging infrastructure for ci-cost.
//!
//! Structured logging using the `tracing` ecosystem:
//!
//! - JSON lines written to a daily rolling file (`~/.ci-cost/logs/ci-cost.log`)
//! - Compact human-readable output on stderr
//! - `RUST_LOG` overrides the default level
//!
//! ## Example
//!
//! ```no_run
//! use ci_cost_core::logging;
//!
//! let _guard = logging::init_logging(None, false).expect("logging init");
//! tracing::info!(project = "mozilla-central", "scan started");
//! ```

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::error::{CoreError, Result};

/// Guard that must be held to ensure log flushing on shutdown.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Initialize logging to a rolling JSON file and to stderr.
///
/// # Arguments
///
/// * `log_dir` - Optional custom log directory. Defaults to `~/.ci-cost/logs/`
/// * `verbose` - If true, sets log level to DEBUG. Otherwise uses INFO.
pub fn init_logging(log_dir: Option<PathBuf>, verbose: bool) -> Result<LogGuard> {
    let log_dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };

    std::fs::create_dir_all(&log_dir).map_err(|e| CoreError::DirectoryCreation {
        path: log_dir.clone(),
        source: e,
    })?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "ci-cost.log");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "ci_cost={default_level},ci_cost_scan={default_level},ci_cost_model={default_level},\
             ci_cost_client={default_level},warn"
        ))
    });

    let file_layer = fmt::layer()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .json()
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_span_list(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(verbose)
        .with_line_number(verbose)
        .compact();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| CoreError::internal(format!("logging already initialized: {e}")))?;

    tracing::debug!(log_dir = %log_dir.display(), verbose, "logging initialized");

    Ok(LogGuard {
        _file_guard: Some(file_guard),
    })
}

/// Initialize minimal console-only logging for tests.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}

/// Get the default log directory path: `~/.ci-cost/logs/`.
pub fn default_log_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CoreError::internal("home directory could not be determined"))?;
    Ok(home.join(".ci-cost").join("logs"))
}

/// Log a cost computed for a graph under the `ci_cost::cost` target.
///
/// ```ignore
/// log_cost_event!(graph_id = "abc", total_cost = 12.5);
/// ```
#[macro_export]
macro_rules! log_cost_event {
    ($($field:tt)*) => {
        tracing::info!(
            target: "ci_cost::cost",
            $($field)*,
            "cost event"
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir_ends_with_logs() {
        if let Ok(dir) = default_log_dir() {
            assert!(dir.ends_with(".ci-cost/logs"));
        }
    }

    #[test]
    fn test_log_dir_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("nested").join("logs");
        // A global subscriber may already be installed by another test; the
        // directory is created before that is checked.
        let _ = init_logging(Some(log_dir.clone()), true);
        assert!(log_dir.is_dir());
    }

    #[test]
    fn test_init_test_logging() {
        init_test_logging();
        log_cost_event!(graph_id = "g", total_cost = 1.0);
    }
}
