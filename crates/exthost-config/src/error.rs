//! Configuration errors

use thiserror::Error;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    /// A provider could not be read or extracted
    #[error("Failed to load configuration: {message}")]
    Load { message: String },

    /// Extracted values failed validation
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    /// The logging subsystem could not be set up or changed
    #[error("Logging error: {message}")]
    Logging { message: String },
}

impl ConfigError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load {
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    pub fn logging(message: impl Into<String>) -> Self {
        Self::Logging {
            message: message.into(),
        }
    }
}
