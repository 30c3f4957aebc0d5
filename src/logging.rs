//! Tracing subscriber setup

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing_subscriber::EnvFilter;

use crate::config::{LogConfig, LogDestination};
use crate::error::ConfigError;

/// Install the global subscriber
///
/// `RUST_LOG` wins when set; otherwise `chat_relay=info`, or
/// `chat_relay=debug` with file and line numbers when `debug` is on.
pub fn init(config: &LogConfig) -> Result<(), ConfigError> {
    let default_level = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("chat_relay={}", default_level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(config.debug)
        .with_line_number(config.debug);

    let result = match &config.destination {
        LogDestination::Stdout => builder.try_init(),
        LogDestination::File(path) => {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .map_err(|source| ConfigError::LogFile {
                    path: path.display().to_string(),
                    source,
                })?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    };

    result.map_err(|e| ConfigError::Logging(e.to_string()))
}
