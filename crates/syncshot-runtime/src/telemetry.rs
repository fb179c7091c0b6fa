//! Structured logging setup for the coordinator and agent binaries
//!
//! `RUST_LOG` takes precedence over the configured level, so a single agent
//! can be made verbose without touching the fleet's launch command.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use syncshot_core::{SyncError, SyncResult};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, one line per event
    #[default]
    Compact,
    /// One JSON object per event, for log shippers
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `syncshot_runtime=debug`
    pub default_filter: String,
    pub format: LogFormat,
    /// Include the emitting thread's name in every event
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            format: LogFormat::Compact,
            thread_names: false,
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        Self {
            format: LogFormat::Json,
            thread_names: true,
            ..Default::default()
        }
    }

    /// Same output, debug level by default
    pub fn verbose(mut self) -> Self {
        self.default_filter = "debug".to_string();
        self
    }

    fn filter(&self) -> SyncResult<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.default_filter).map_err(|e| {
                SyncError::InvalidConfig(format!("log filter {:?}: {}", self.default_filter, e))
            }),
        }
    }
}

/// Install the global subscriber.
///
/// Fails if the filter directive is invalid or a subscriber is already set.
pub fn init_logging(config: &LoggingConfig) -> SyncResult<()> {
    let filter = config.filter()?;

    let result = match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_thread_names(config.thread_names))
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_thread_names(config.thread_names))
            .try_init(),
    };

    result.map_err(|e| SyncError::InvalidConfig(format!("logging already initialised: {}", e)))
}
