//! Lockstep: a staged pipeline runtime.
//!
//! A fixed collection of work items flows through an ordered chain of stages.
//! Each stage processes every item, either one at a time (sequential) or all
//! at once (parallel), and hands each finished item to its successor through
//! a per-item signal. The last stage is an aggregation step that only starts
//! once every other stage has drained.
//!
//! See [`pipeline`] for the runtime and [`config`] for file-based setup.

pub mod config;
pub mod pipeline;

pub use lockstep_shared::errors::{LockstepError, LockstepResult};

use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// File name used when logging to a directory.
pub const LOG_FILE_NAME: &str = "lockstep.log";

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`. With `log_dir` set, events go to
/// `<log_dir>/lockstep.log` through a non-blocking writer and the returned
/// guard must be held until shutdown to flush it. Otherwise events go to
/// stderr.
pub fn init_logging(level: &str, log_dir: Option<&Path>) -> LockstepResult<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("lockstep={level}")))
        .map_err(|e| LockstepError::Config(format!("Invalid log level {level:?}: {e}")))?;

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                LockstepError::Config(format!(
                    "Failed to create log directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .map_err(|e| LockstepError::Internal(format!("Failed to install logger: {e}")))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .try_init()
                .map_err(|e| LockstepError::Internal(format!("Failed to install logger: {e}")))?;
            Ok(None)
        }
    }
}
