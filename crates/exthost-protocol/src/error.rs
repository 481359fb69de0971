//! Error types for the RPC core

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result type alias used throughout the protocol crate
pub type RpcResult<T> = Result<T, RpcError>;

/// Errors surfaced by the envelope channel, the registry and the RPC core
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RpcError {
    /// The call was cancelled locally or the RPC core was disposed
    #[error("Canceled")]
    Cancelled,

    /// The underlying stream is closed
    #[error("Channel closed: {message}")]
    ChannelClosed { message: String },

    /// Malformed envelope or payload
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// An actor is already registered under this id
    #[error("Actor {actor} is already registered")]
    Conflict { actor: String },

    /// No local actor is registered under this id
    #[error("Unknown actor {actor}")]
    UnknownActor { actor: String },

    /// The actor exists but does not expose the method
    #[error("Unknown method {method}")]
    UnknownMethod { method: String },

    /// Proxy member that is not remotely invocable
    #[error("Method {method} is not remotely invocable (missing '$' prefix)")]
    NotRemotable { method: String },

    /// Invalid arguments handed to an actor method
    #[error("Invalid arguments for {method}: {message}")]
    InvalidArguments { method: String, message: String },

    /// Error raised by actor code, or reconstructed from a Reply-Error
    #[error("{name}: {message}")]
    Remote {
        name: String,
        message: String,
        stack: Option<String>,
    },
}

impl RpcError {
    /// Create a new channel closed error
    pub fn channel_closed(message: impl Into<String>) -> Self {
        Self::ChannelClosed {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new unknown method error
    pub fn unknown_method(method: impl Into<String>) -> Self {
        Self::UnknownMethod {
            method: method.into(),
        }
    }

    /// Create a new invalid arguments error
    pub fn invalid_arguments(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArguments {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Create an application-level error with the given name and message
    pub fn remote(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Remote {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    /// Whether this error represents a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short error class name carried in serialized errors
    pub fn name(&self) -> &str {
        match self {
            Self::Cancelled => "Canceled",
            Self::ChannelClosed { .. } => "ChannelClosed",
            Self::Protocol { .. } => "ProtocolError",
            Self::Conflict { .. } => "Conflict",
            Self::UnknownActor { .. } => "UnknownActor",
            Self::UnknownMethod { .. } => "UnknownMethod",
            Self::NotRemotable { .. } => "NotRemotable",
            Self::InvalidArguments { .. } => "InvalidArguments",
            Self::Remote { name, .. } => name,
        }
    }
}

/// Wire form of an error carried by a Reply-Error envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    #[serde(rename = "$isError")]
    pub is_error: bool,
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl SerializedError {
    /// Serialize an error for transmission
    pub fn from_error(err: &RpcError) -> Self {
        let (message, stack) = match err {
            RpcError::Remote { message, stack, .. } => (message.clone(), stack.clone()),
            other => (other.to_string(), None),
        };
        Self {
            is_error: true,
            name: err.name().to_string(),
            message,
            stack,
        }
    }

    /// Reconstruct an error from a Reply-Error payload
    ///
    /// Payloads without the `$isError` marker are kept as the raw JSON text.
    pub fn revive(payload: &Value) -> RpcError {
        match serde_json::from_value::<SerializedError>(payload.clone()) {
            Ok(err) if err.is_error => RpcError::Remote {
                name: err.name,
                message: err.message,
                stack: err.stack,
            },
            _ => RpcError::remote("Error", payload.to_string()),
        }
    }
}

impl From<RpcError> for SerializedError {
    fn from(err: RpcError) -> Self {
        Self::from_error(&err)
    }
}
