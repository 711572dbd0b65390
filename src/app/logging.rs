use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::app::config::LoggingConfig;
use crate::error::{Error, Result};

pub const LOG_FILE_PREFIX: &str = "quill.log";

/// Filter used when `RUST_LOG` is unset.
pub fn default_filter(config: &LoggingConfig, debug: bool) -> String {
    if debug {
        "quill_ai=debug,quill=debug".to_string()
    } else {
        config.level.clone()
    }
}

/// Install the global subscriber. The returned guard flushes the log file
/// and must be held for the life of the process.
pub fn init_logging(config: &LoggingConfig, logs_dir: &Path, debug: bool) -> Result<Option<WorkerGuard>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter(config, debug))
            .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.level, e)))?,
    };

    let console = if config.json {
        fmt::layer().json().with_writer(std::io::stderr).boxed()
    } else {
        fmt::layer().with_target(false).with_writer(std::io::stderr).boxed()
    };

    let (file_layer, guard) = if config.file {
        std::fs::create_dir_all(logs_dir)?;
        let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}
