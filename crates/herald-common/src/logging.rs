//! Logging initialisation
//!
//! Installs a `tracing` subscriber with a console layer and an optional
//! daily-rolling `herald.log` file layer. `RUST_LOG` takes precedence over the
//! configured level when set.

use std::path::PathBuf;

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::error::{HeraldError, Result};

pub const LOG_FILE_NAME: &str = "herald.log";

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub console_output: bool,
    /// Directory for `herald.log`; `None` disables file logging
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            console_output: true,
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    /// Read `HERALD_LOG_LEVEL`, `HERALD_LOG_CONSOLE` and `HERALD_LOG_DIR`.
    pub fn from_env() -> Self {
        let level = std::env::var("HERALD_LOG_LEVEL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(Level::INFO);

        let console_output = std::env::var("HERALD_LOG_CONSOLE")
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        let log_dir = std::env::var("HERALD_LOG_DIR").ok().map(PathBuf::from);

        Self {
            level,
            console_output,
            log_dir,
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.level.to_string()))
    }
}

/// Keeps the non-blocking file writer alive; flushes on drop.
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    let mut file_guard = None;

    if config.console_output {
        let layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_filter(config.filter());
        layers.push(Box::new(layer));
    }

    if let Some(log_dir) = &config.log_dir {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            HeraldError::Config(format!(
                "cannot create log directory {}: {}",
                log_dir.display(),
                e
            ))
        })?;
        let appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        file_guard = Some(guard);

        let layer = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(config.filter());
        layers.push(Box::new(layer));
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| HeraldError::Config(format!("failed to initialize logging: {}", e)))?;

    tracing::debug!(
        level = %config.level,
        file = config.log_dir.is_some(),
        "Logging initialized"
    );

    Ok(LoggingGuard {
        _file_guard: file_guard,
    })
}
