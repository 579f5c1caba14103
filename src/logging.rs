//! Tracing subscriber setup for the CLI.
//!
//! Log lines go to stderr so command output on stdout stays scriptable.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RecastConfig;

#[derive(Debug, Clone)]
pub struct LogOptions {
    /// `EnvFilter` directive, e.g. `info` or `recast=debug,recast_common=trace`
    pub filter: String,
    pub json: bool,
    /// Directory for a daily rolling log file
    pub file_dir: Option<PathBuf>,
}

impl LogOptions {
    pub fn from_config(config: &RecastConfig) -> Self {
        Self {
            filter: config.log_filter(),
            json: config.toml.logging.json,
            file_dir: config.toml.logging.file.then(|| config.log_dir()),
        }
    }
}

/// Install the global subscriber. Keep the returned guard alive until exit
/// so buffered file output is flushed.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(&options.filter)
        .with_context(|| format!("Invalid log filter '{}'", options.filter))?;

    let json_layer = options
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!options.json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });

    let (file_layer, guard) = match &options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "recast.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_filter_is_rejected() {
        let options = LogOptions {
            filter: "recast=notalevel".to_string(),
            json: false,
            file_dir: None,
        };
        let err = init(&options).unwrap_err();
        assert!(err.to_string().contains("Invalid log filter"));
    }
}
