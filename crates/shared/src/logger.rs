use core::str::FromStr;
use std::{
    fs::create_dir_all,
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{
    Level,
    subscriber::{SetGlobalDefaultError, set_global_default},
};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{layer::SubscriberExt, registry};

/// Where and how verbosely to log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// The directory the rolling log files are written to.
    pub directory: PathBuf,

    /// The default level, one of `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,

    /// How many daily log files to keep.
    pub max_log_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            level: "info".to_string(),
            max_log_files: 90,
        }
    }
}

impl LogConfig {
    /// Parses the configured level.
    pub fn level(&self) -> Result<Level, LoggerError> {
        Level::from_str(&self.level).map_err(|_| LoggerError::InvalidLevel(self.level.clone()))
    }
}

/// Create and set the global loggers.
pub fn init_logger(config: &LogConfig) -> Result<Vec<WorkerGuard>, LoggerError> {
    let level = config.level()?;
    create_log_directory(&config.directory)?;

    let filter = tracing_subscriber::filter::Targets::new().with_default(level);

    // File layer
    let (file_guard, file_layer) = {
        let appender = RollingFileAppender::builder()
            .filename_suffix("log")
            .rotation(Rotation::DAILY)
            .max_log_files(config.max_log_files)
            .build(&config.directory)?;

        let (writer, guard) = tracing_appender::non_blocking(appender);

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(false);

        (guard, layer)
    };

    // Std layer
    let (std_guard, std_layer) = {
        let (writer, guard) = tracing_appender::non_blocking(io::stdout());

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(true)
            .with_target(false);

        (guard, layer)
    };

    // Create registry
    let registry = registry().with(file_layer).with(std_layer).with(filter);

    // Set global subscriber
    set_global_default(registry)?;

    Ok(vec![file_guard, std_guard])
}

fn create_log_directory(directory: &Path) -> Result<(), LoggerError> {
    create_dir_all(directory).map_err(LoggerError::CreateDirectory)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Invalid log level '{0}'")]
    InvalidLevel(String),

    #[error("Failed to create rolling appender:\n{0}")]
    CreateRollingAppender(#[from] tracing_appender::rolling::InitError),

    #[error("Failed to create log directory:\n{0}")]
    CreateDirectory(#[source] io::Error),

    #[error("A global logger is already set:\n{0}")]
    SetGlobalDefault(#[from] SetGlobalDefaultError),
}
