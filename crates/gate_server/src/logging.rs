//! Process-wide `tracing` subscriber for the gate binary.

use crate::config::LoggingSettings;
use std::fmt;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{
    filter::ParseError, fmt as layer_fmt, layer::SubscriberExt, util::SubscriberInitExt,
    util::TryInitError, EnvFilter,
};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid log filter {filter:?}: {source}")]
    Filter {
        filter: String,
        #[source]
        source: ParseError,
    },
    #[error("a global log subscriber is already installed")]
    AlreadyInstalled(#[from] TryInitError),
}

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// JSON if either the configuration or the `--json-logs` flag asks for it.
    pub fn resolve(settings: &LoggingSettings, json_flag: bool) -> Self {
        if json_flag || settings.json_format {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => f.write_str("pretty"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// `RUST_LOG` wins over the configured level; a bad configured level is an
/// error rather than a silent fallback.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level).map_err(|source| LoggingError::Filter {
        filter: level.to_string(),
        source,
    })
}

/// Installs the global subscriber for the gate process.
pub fn setup_logging(settings: &LoggingSettings, json_flag: bool) -> Result<(), LoggingError> {
    let filter = build_filter(&settings.level)?;
    let format = LogFormat::resolve(settings, json_flag);
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                layer_fmt::layer()
                    .json()
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_names(true),
            )
            .try_init()?,
        LogFormat::Pretty => registry
            .with(
                layer_fmt::layer()
                    .with_ansi(true)
                    .with_file(false)
                    .with_line_number(false)
                    .with_thread_names(true),
            )
            .try_init()?,
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %settings.level,
        %format,
        "🔧 Gate logging initialized"
    );
    Ok(())
}
