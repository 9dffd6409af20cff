//! File logging for `vf`.
//!
//! stdout belongs to command output and the serve protocol, so logs go to a
//! daily-rolled file under `<dataDir>/logs/`. `RUST_LOG` picks the filter
//! (default `info`); `VF_DEBUG_LOG=1` forces `debug`.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

pub const DEBUG_LOG_ENV: &str = "VF_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "vf.log";

fn debug_enabled() -> bool {
    env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// process lifetime so buffered lines are flushed. Logging failures never
/// stop the command.
pub fn init(logs_dir: &Path) -> Option<WorkerGuard> {
    if fs_err::create_dir_all(logs_dir).is_err() {
        return None;
    }

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(logs_dir)
        .ok()?;
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .ok()?;

    Some(guard)
}
