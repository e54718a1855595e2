//! Logging setup for engine binaries and test harnesses.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{Error, Result};

/// Output shape for the global subscriber.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is not set.
    pub level: Level,
    /// Emit one JSON object per event instead of the human format.
    pub json: bool,
    /// Include source file and line on each event.
    pub file_info: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            json: false,
            file_info: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_json(mut self) -> Self {
        self.json = true;
        self
    }

    pub fn with_file_info(mut self) -> Self {
        self.file_info = true;
        self
    }
}

/// Install the global subscriber.
///
/// A `RUST_LOG` directive in the environment overrides the configured
/// level. Fails with [`Error::Logging`] if a subscriber is already
/// installed, so callers that may run after another init (tests, embedders)
/// can ignore the error.
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_file(config.file_info)
        .with_line_number(config.file_info);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| Error::Logging(e.to_string()))
}

/// Parse a log level name (`"trace"` through `"error"`) from config input.
pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| Error::Config(format!("invalid log level: {level}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_levels() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(matches!(
            parse_log_level("loud"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn builders_compose() {
        let config = LoggingConfig::new(Level::TRACE).with_json().with_file_info();
        assert_eq!(config.level, Level::TRACE);
        assert!(config.json && config.file_info);
    }
}
