//! Layered configuration for the plugin host

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Files probed, in order, when no explicit path is given
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["exthost.toml", ".exthost/config.toml"];

/// Prefix for environment overrides, e.g. `EXTHOST__LOGGING__LEVEL=debug`
pub const ENV_PREFIX: &str = "EXTHOST__";

const VALID_LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtHostConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub build: BuildConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable format for development
    #[default]
    Pretty,
    /// Structured JSON format for production
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error or off
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Time without acknowledgement before the peer counts as unresponsive
    pub unresponsive_threshold_ms: u64,
    pub recheck_interval_ms: u64,
    /// First id used for outbound requests
    pub first_request_id: i64,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            unresponsive_threshold_ms: 3000,
            recheck_interval_ms: 1000,
            first_request_id: 1,
        }
    }
}

impl ProtocolConfig {
    pub fn unresponsive_threshold(&self) -> Duration {
        Duration::from_millis(self.unresponsive_threshold_ms)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// How often the parent process is probed
    pub orphan_poll_interval_ms: u64,
    /// Minimum time between Terminate and exit
    pub shutdown_grace_ms: u64,
    /// Maximum time between Terminate and exit
    pub shutdown_timeout_ms: u64,
    /// Run the OS-thread watchdog alongside the async one
    pub native_watchdog: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            orphan_poll_interval_ms: 1000,
            shutdown_grace_ms: 1000,
            shutdown_timeout_ms: 4000,
            native_watchdog: true,
        }
    }
}

impl LifecycleConfig {
    pub fn orphan_poll_interval(&self) -> Duration {
        Duration::from_millis(self.orphan_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Build marker compared against the host's during the handshake
    pub commit: Option<String>,
}

impl ExtHostConfig {
    /// Load configuration
    ///
    /// Priority order (highest to lowest):
    /// 1. Environment variables (`EXTHOST__SECTION__KEY`)
    /// 2. The explicit file if given, otherwise the first of
    ///    `exthost.toml` / `.exthost/config.toml` that exists
    /// 3. Default values
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Toml},
            Figment,
        };

        let mut figment = Figment::from(Serialized::defaults(ExtHostConfig::default()));

        match explicit {
            Some(path) => {
                if !path.exists() {
                    return Err(ConfigError::load(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                tracing::info!(path = %path.display(), "Loading TOML configuration");
                figment = figment.merge(Toml::file(path));
            }
            None => {
                if let Some(path) = Self::find_default_file() {
                    tracing::info!(path = %path.display(), "Loading TOML configuration");
                    figment = figment.merge(Toml::file(path));
                }
            }
        }

        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: ExtHostConfig = figment
            .extract()
            .map_err(|e| ConfigError::load(e.to_string()))?;
        config.validate()?;

        tracing::debug!(
            level = %config.logging.level,
            shutdown_timeout_ms = config.lifecycle.shutdown_timeout_ms,
            "Configuration loaded"
        );
        Ok(config)
    }

    fn find_default_file() -> Option<PathBuf> {
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigResult<()> {
        if !VALID_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(format!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }

        if self.protocol.unresponsive_threshold_ms == 0 {
            return Err(ConfigError::invalid("Unresponsive threshold cannot be 0"));
        }
        if self.protocol.recheck_interval_ms == 0 {
            return Err(ConfigError::invalid("Recheck interval cannot be 0"));
        }
        if self.protocol.first_request_id < 0 {
            return Err(ConfigError::invalid("First request id cannot be negative"));
        }

        if self.lifecycle.orphan_poll_interval_ms == 0 {
            return Err(ConfigError::invalid("Orphan poll interval cannot be 0"));
        }
        if self.lifecycle.shutdown_grace_ms > self.lifecycle.shutdown_timeout_ms {
            return Err(ConfigError::invalid(format!(
                "Shutdown grace ({}ms) cannot exceed shutdown timeout ({}ms)",
                self.lifecycle.shutdown_grace_ms, self.lifecycle.shutdown_timeout_ms
            )));
        }

        if let Some(commit) = &self.build.commit {
            if commit.trim().is_empty() {
                return Err(ConfigError::invalid("Build commit cannot be blank"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::env;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
        let path = dir.path().join("exthost.toml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ExtHostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.protocol.unresponsive_threshold(), Duration::from_secs(3));
        assert_eq!(config.lifecycle.shutdown_grace(), Duration::from_secs(1));
        assert_eq!(config.lifecycle.shutdown_timeout(), Duration::from_secs(4));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            r#"
[logging]
level = "debug"
format = "json"

[lifecycle]
shutdown_timeout_ms = 6000

[build]
commit = "abc123"
"#,
        );

        let config = ExtHostConfig::load(Some(&path)).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.lifecycle.shutdown_timeout_ms, 6000);
        // Untouched keys keep their defaults
        assert_eq!(config.lifecycle.shutdown_grace_ms, 1000);
        assert_eq!(config.build.commit.as_deref(), Some("abc123"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(&temp_dir, "[logging]\nlevel = \"debug\"\n");

        env::set_var("EXTHOST__LOGGING__LEVEL", "warn");
        env::set_var("EXTHOST__PROTOCOL__RECHECK_INTERVAL_MS", "250");
        let result = ExtHostConfig::load(Some(&path));
        env::remove_var("EXTHOST__LOGGING__LEVEL");
        env::remove_var("EXTHOST__PROTOCOL__RECHECK_INTERVAL_MS");

        let config = result.unwrap();
        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.protocol.recheck_interval_ms, 250);
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.toml");
        assert!(matches!(
            ExtHostConfig::load(Some(&missing)),
            Err(ConfigError::Load { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_invalid_values_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = write_config(
            &temp_dir,
            "[lifecycle]\nshutdown_grace_ms = 5000\nshutdown_timeout_ms = 4000\n",
        );
        let err = ExtHostConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Shutdown grace"));

        let mut config = ExtHostConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }
}
