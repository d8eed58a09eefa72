/*!
 * Diagnostic output for the engine and its crates
 *
 * One global subscriber: an `EnvFilter` scoped to the conduit crates in
 * front of a single formatting layer chosen by [`LogSink`].
 */

use std::fs::{File, OpenOptions};
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{ConduitError, Result};

/// Where log lines go
enum LogSink {
    /// Human-readable lines on stdout
    Compact,
    /// JSON lines on stdout, for collectors
    JsonStdout,
    /// JSON lines appended to a file, with source locations
    JsonFile(File),
}

impl LogSink {
    fn from_config(config: &LoggingConfig) -> Result<Self> {
        match (&config.file, config.json) {
            (Some(path), _) => OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map(LogSink::JsonFile)
                .map_err(|e| {
                    ConduitError::Config(format!("Cannot open log file {}: {}", path.display(), e))
                }),
            (None, true) => Ok(LogSink::JsonStdout),
            (None, false) => Ok(LogSink::Compact),
        }
    }
}

/// Install the global subscriber described by `config`
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a
/// subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = build_filter(config)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match LogSink::from_config(config)? {
        LogSink::Compact => registry.with(fmt::layer().compact()).try_init(),
        LogSink::JsonStdout => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogSink::JsonFile(file) => registry
            .with(
                fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    };
    installed.map_err(|e| ConduitError::Config(format!("Logging already initialized: {}", e)))
}

fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(from_env) = EnvFilter::try_from_default_env() {
        return Ok(from_env);
    }
    let level = config.level.to_tracing_level();
    let directives = ["conduit", "conduit_registry", "conduit_store"]
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(directives)
        .map_err(|e| ConduitError::Config(format!("Invalid log filter: {}", e)))
}
