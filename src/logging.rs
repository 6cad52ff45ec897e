//! Subscriber setup. The console always gets `RUST_LOG`-filtered output;
//! `warden run` additionally writes daily files (`warden.YYYY-MM-DD.log`)
//! unless `[logging] disable = true`.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use thiserror::Error;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::resolve::resolve_config;
use crate::config::{resolve_path, LoadedConfig};

pub const FILE_PREFIX: &str = "warden";
pub const FILE_SUFFIX: &str = "log";

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open log file: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),
    #[error("logging already initialized: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Accepts `off`, `error`, `warn`, `info`, `debug` and `trace` in any case.
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(level.trim()).ok()
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileLogging {
    pub directory: PathBuf,
    pub level: LevelFilter,
}

impl FileLogging {
    /// `None` when file logging is disabled. An unparseable level falls back
    /// to `info`; `warden validate` reports it.
    pub fn from_config(loaded: &LoadedConfig) -> Option<Self> {
        let cfg = &loaded.config.logging;
        if cfg.disable {
            return None;
        }
        let directory = match &cfg.directory {
            Some(dir) => resolve_path(&loaded.base_dir, dir),
            None => loaded.state_dir().join("logs"),
        };
        Some(Self {
            directory,
            level: parse_level(&cfg.level).unwrap_or(LevelFilter::INFO),
        })
    }

    /// Read the `[logging]` section ahead of the command itself. Config
    /// errors are left for the command to report.
    pub fn discover(config_file: Option<&Path>) -> Option<Self> {
        let path = resolve_config(config_file).ok()?;
        let loaded = LoadedConfig::load(&path).ok()?;
        Self::from_config(&loaded)
    }

    fn appender(&self) -> Result<RollingFileAppender, LoggingError> {
        std::fs::create_dir_all(&self.directory).map_err(|source| LoggingError::Directory {
            path: self.directory.clone(),
            source,
        })?;
        Ok(RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix(FILE_PREFIX)
            .filename_suffix(FILE_SUFFIX)
            .build(&self.directory)?)
    }
}

fn console_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Keep the returned guard alive for as long
/// as file output should be flushed.
pub fn init(file: Option<&FileLogging>) -> Result<Option<WorkerGuard>, LoggingError> {
    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(console_filter());

    let (file_layer, guard) = match file {
        Some(file) => {
            let (writer, guard) = tracing_appender::non_blocking(file.appender()?);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(file.level);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()?;
    Ok(guard)
}
