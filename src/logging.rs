//! Process-wide `tracing` subscriber setup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "stagehand.log";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    /// `EnvFilter` directive, e.g. `info` or `stagehand=debug,tower_http=info`.
    pub level: String,
    pub format: LogFormat,
    /// When set, logs go to a daily-rotated file in this directory instead of stderr.
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            dir: None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoggingError {
    #[error("Invalid log filter '{filter}': {reason}")]
    Filter { filter: String, reason: String },

    #[error("Failed to create log directory {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to install logger: {0}")]
    Install(String),
}

/// Build the filter for `settings`. A non-empty `RUST_LOG` wins over the
/// configured level.
pub fn build_filter(settings: &LogSettings) -> Result<EnvFilter, LoggingError> {
    filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok(), settings)
}

fn filter_from(env_directive: Option<String>, settings: &LogSettings) -> Result<EnvFilter, LoggingError> {
    let directive = env_directive
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| settings.level.clone());
    EnvFilter::try_new(&directive).map_err(|e| LoggingError::Filter {
        filter: directive,
        reason: e.to_string(),
    })
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered lines are lost on exit.
pub fn init(settings: &LogSettings) -> Result<WorkerGuard, LoggingError> {
    let filter = build_filter(settings)?;

    let (writer, guard) = match &settings.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|source| LoggingError::Io {
                path: dir.clone(),
                source,
            })?;
            tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX))
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(settings.dir.is_none());

    let installed = match settings.format {
        LogFormat::Pretty => builder.with_target(false).try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };
    installed.map_err(|e| LoggingError::Install(e.to_string()))?;

    Ok(guard)
}
