//! Lifecycle errors

use exthost_protocol::RpcError;
use thiserror::Error;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Error, Debug)]
pub enum LifecycleError {
    /// The host and plugin host were built from different commits
    #[error("Incompatible build: host is {host}, plugin host is {plugin_host}")]
    IncompatibleBuild { host: String, plugin_host: String },

    /// Terminate arrived before initialization finished
    #[error("Terminated during handshake")]
    TerminatedDuringHandshake,

    /// The channel closed before the handshake finished
    #[error("Channel closed during handshake")]
    ChannelClosed,

    /// Unexpected envelope or payload during the handshake
    #[error("Handshake error: {message}")]
    Handshake { message: String },

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl LifecycleError {
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }
}
