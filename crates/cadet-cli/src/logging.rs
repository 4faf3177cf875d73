//! File logging.
//!
//! Logs go to a daily file under `$CADET_HOME/logs`; stdout and stderr
//! belong to the REPL.

use cadet_core::config::{Config, paths};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const LOG_ENV: &str = "CADET_LOG";

/// Installs the global subscriber. The returned guard flushes the writer on
/// drop and must outlive every log call.
///
/// Returns `None` when the log directory is unusable; the session runs
/// without logs in that case.
pub fn init(config: &Config) -> Option<WorkerGuard> {
    let dir = paths::logs_dir();
    if let Err(err) = std::fs::create_dir_all(&dir) {
        eprintln!("Warning: logging disabled ({}: {err})", dir.display());
        return None;
    }

    let appender = match RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("cadet")
        .filename_suffix("log")
        .build(&dir)
    {
        Ok(appender) => appender,
        Err(err) => {
            eprintln!("Warning: logging disabled ({err})");
            return None;
        }
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    // Already installed (tests that call into the CLI twice) is fine.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layer)
        .try_init();

    Some(guard)
}
