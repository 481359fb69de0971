//! Initialization payload sent by the host right after Ready

use crate::error::{LifecycleError, LifecycleResult};
use exthost_protocol::{Envelope, MessageKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Configuration the host hands to a freshly started plugin host
///
/// Fields this crate does not interpret are kept in `extra` so actors can
/// read them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitData {
    /// Process to watch for orphan detection
    #[serde(default)]
    pub parent_pid: Option<i32>,
    #[serde(default)]
    pub extensions: Vec<PluginDescription>,
    #[serde(default)]
    pub environment: Environment,
    #[serde(default)]
    pub workspace: Option<Value>,
    #[serde(default)]
    pub logs_location_path: Option<PathBuf>,
    /// Numeric host log level (0 = trace … 6 = off)
    #[serde(default)]
    pub log_level: Option<u8>,
    #[serde(default)]
    pub auto_start: bool,
    /// Build marker of the host
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One plugin known to the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescription {
    pub identifier: String,
    #[serde(default)]
    pub extension_location_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    #[serde(default)]
    pub app_root_path: Option<PathBuf>,
    #[serde(default)]
    pub app_settings_home_path: Option<PathBuf>,
    #[serde(default)]
    pub extension_development_location_path: Option<PathBuf>,
    #[serde(default)]
    pub extension_tests_location_path: Option<PathBuf>,
    #[serde(default)]
    pub global_storage_home_path: Option<PathBuf>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InitData {
    /// Interpret an envelope received during the handshake as init data
    ///
    /// Hosts in the wild send init data under kinds other than InitData, so
    /// any lifecycle kind with an object payload is accepted. Requests,
    /// replies and control envelopes never are.
    pub fn from_envelope(envelope: &Envelope) -> LifecycleResult<Self> {
        if !matches!(
            envelope.kind,
            MessageKind::InitData | MessageKind::Initialized | MessageKind::Ready
        ) {
            return Err(LifecycleError::handshake(format!(
                "{:?} envelope cannot carry init data",
                envelope.kind
            )));
        }
        if !envelope.payload.is_object() {
            return Err(LifecycleError::handshake("Init data must be a JSON object"));
        }

        serde_json::from_value(envelope.payload.clone())
            .map_err(|e| LifecycleError::handshake(format!("Malformed init data: {}", e)))
    }

    /// Plugins may end the process themselves only under a test runner
    pub fn allows_plugin_exit(&self) -> bool {
        self.environment.extension_tests_location_path.is_some()
    }

    /// `(identifier, location)` for every plugin with a known location
    pub fn plugin_locations(&self) -> impl Iterator<Item = (&str, &PathBuf)> {
        self.extensions.iter().filter_map(|plugin| {
            plugin
                .extension_location_path
                .as_ref()
                .map(|path| (plugin.identifier.as_str(), path))
        })
    }
}
