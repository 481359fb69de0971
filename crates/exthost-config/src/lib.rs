//! Configuration and logging setup for the plugin host

pub mod config;
pub mod error;
pub mod logging;

pub use config::{
    BuildConfig, ExtHostConfig, LifecycleConfig, LogFormat, LoggingConfig, ProtocolConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use logging::{LogHandle, LogLevel};
