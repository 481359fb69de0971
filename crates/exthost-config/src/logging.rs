//! Logging initialization with environment variable support and a runtime
//! level switch

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{
    fmt as tracing_fmt, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

/// Log levels as numbered by the host (`Trace = 0` … `Off = 6`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum LogLevel {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
    Critical = 5,
    Off = 6,
}

impl LogLevel {
    /// Filter directive understood by `EnvFilter`
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            // tracing has no level above error
            LogLevel::Error | LogLevel::Critical => "error",
            LogLevel::Off => "off",
        }
    }
}

impl TryFrom<u8> for LogLevel {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, String> {
        Ok(match code {
            0 => LogLevel::Trace,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            5 => LogLevel::Critical,
            6 => LogLevel::Off,
            other => return Err(format!("unknown log level {}", other)),
        })
    }
}

impl From<LogLevel> for u8 {
    fn from(level: LogLevel) -> Self {
        level as u8
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            "off" => Ok(LogLevel::Off),
            other => Err(ConfigError::invalid(format!("Unknown log level '{}'", other))),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_directive())
    }
}

/// Handle for changing the active filter after initialization
#[derive(Clone)]
pub struct LogHandle {
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

impl LogHandle {
    /// Handle that accepts level changes and ignores them
    pub fn detached() -> Self {
        Self { reload: None }
    }

    /// Replace the active filter with a single level
    pub fn set_level(&self, level: LogLevel) -> ConfigResult<()> {
        let Some(handle) = &self.reload else {
            return Ok(());
        };
        handle
            .reload(EnvFilter::new(level.as_directive()))
            .map_err(|e| ConfigError::logging(format!("Failed to change log level: {}", e)))?;
        tracing::info!(level = %level, "Log level changed");
        Ok(())
    }
}

impl fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogHandle")
            .field("attached", &self.reload.is_some())
            .finish()
    }
}

/// Parse a `LOG_FORMAT` value
pub fn parse_format(value: &str) -> Option<LogFormat> {
    match value.to_lowercase().as_str() {
        "json" => Some(LogFormat::Json),
        "pretty" | "human" => Some(LogFormat::Pretty),
        _ => None,
    }
}

/// Initialize the global tracing subscriber
///
/// Environment variables (in priority order):
/// - `RUST_LOG`: standard filter, takes precedence over the configured level
/// - `LOG_FORMAT`: override format (json, pretty)
///
/// Output always goes to stderr. Stdout carries the protocol.
pub fn initialize(config: &LoggingConfig) -> ConfigResult<LogHandle> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| ConfigError::logging(format!("Invalid log filter: {}", e)))?;
    let (filter, handle) = reload::Layer::new(env_filter);

    let format = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|f| parse_format(&f))
        .unwrap_or(config.format);

    let result = match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init(),
    };
    result.map_err(|e| ConfigError::logging(format!("Failed to install subscriber: {}", e)))?;

    Ok(LogHandle {
        reload: Some(handle),
    })
}
