//! Logging configuration and setup.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::SwCacheError;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format.
    #[default]
    Pretty,
    /// Compact single-line format.
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration.
///
/// Deserializable so it can live in the `logging` section of the worker config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Include source file location.
    pub include_location: bool,
    /// Include thread names.
    pub include_thread_names: bool,
    /// Include span events (enter, exit).
    pub include_span_events: bool,
    /// Custom filter string (e.g., "swcache_worker=debug,reqwest=warn").
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            include_location: false,
            include_thread_names: false,
            include_span_events: false,
            filter: None,
        }
    }
}

impl LogConfig {
    /// Create a debug configuration.
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            include_location: true,
            include_span_events: true,
            ..Default::default()
        }
    }

    /// Create a production configuration.
    pub fn production() -> Self {
        Self {
            format: LogFormat::Json,
            filter: Some("swcache_worker=info,swcache_store=warn,swcache_net=warn".to_string()),
            ..Default::default()
        }
    }

    /// Set a custom filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Parse the configured level.
    pub fn parsed_level(&self) -> Result<Level, SwCacheError> {
        self.level
            .parse::<Level>()
            .map_err(|_| SwCacheError::InvalidArgument(format!("log level `{}`", self.level)))
    }

    /// Check the level and the custom filter without installing anything.
    pub fn validate(&self) -> Result<(), SwCacheError> {
        self.parsed_level()?;
        if let Some(ref custom) = self.filter {
            parse_filter(custom)?;
        }
        Ok(())
    }

    fn env_filter(&self) -> Result<EnvFilter, SwCacheError> {
        let level = self.parsed_level()?;
        Ok(match self.filter {
            Some(ref custom) => parse_filter(custom)?,
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.to_string())),
        })
    }
}

fn parse_filter(custom: &str) -> Result<EnvFilter, SwCacheError> {
    EnvFilter::try_new(custom)
        .map_err(|e| SwCacheError::InvalidArgument(format!("log filter `{custom}`: {e}")))
}

/// Initialize logging.
///
/// An invalid level or filter is `InvalidArgument`; an already installed
/// global subscriber is `Logging`.
pub fn try_init_logging(config: &LogConfig) -> Result<(), SwCacheError> {
    let filter = config.env_filter()?;

    let span_events = if config.include_span_events {
        FmtSpan::ENTER | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let result = match config.format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_file(config.include_location)
                .with_line_number(config.include_location)
                .with_thread_names(config.include_thread_names)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Compact => {
            let fmt_layer = fmt::layer()
                .compact()
                .with_target(true)
                .with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer().json().with_span_events(span_events);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()
        }
    };

    result.map_err(|e| SwCacheError::Logging(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.parsed_level().unwrap(), Level::INFO);
        assert!(!config.include_location);
    }

    #[test]
    fn test_log_config_debug() {
        let config = LogConfig::debug();
        assert_eq!(config.parsed_level().unwrap(), Level::DEBUG);
        assert!(config.include_location);
    }

    #[test]
    fn test_log_config_with_filter() {
        let config = LogConfig::default().with_filter("swcache_worker=debug");
        assert_eq!(config.filter, Some("swcache_worker=debug".to_string()));
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LogConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.parsed_level(),
            Err(SwCacheError::InvalidArgument(_))
        ));
        assert!(config.validate().is_err());
        assert!(matches!(
            try_init_logging(&config),
            Err(SwCacheError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_filter_rejected() {
        let config = LogConfig::default().with_filter("swcache_worker=loud");
        assert!(matches!(
            config.validate(),
            Err(SwCacheError::InvalidArgument(_))
        ));
        assert!(LogConfig::production().validate().is_ok());
    }

    #[test]
    fn test_log_config_from_json() {
        let config: LogConfig =
            serde_json::from_str(r#"{ "level": "warn", "format": "json" }"#).unwrap();
        assert_eq!(config.parsed_level().unwrap(), Level::WARN);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.filter.is_none());
    }
}
