//! Plugin host protocol
//!
//! Layers, bottom up:
//! - [`framing`]: Content-Length frames carrying JSON-RPC notifications
//! - [`channel`]: ordered envelope delivery over a duplex byte stream
//! - [`registry`]: local actors and cached remote proxies
//! - [`correlation`]: in-flight call bookkeeping
//! - [`responsiveness`]: acknowledgement-latency monitor
//! - [`rpc`]: the dispatcher tying them together

pub mod channel;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod framing;
pub mod registry;
pub mod responsiveness;
pub mod rpc;

pub use channel::{EnvelopeChannel, EnvelopeReceiver, EnvelopeSender};
pub use correlation::PendingReply;
pub use envelope::{ActorId, Envelope, MessageKind, Reply, RequestId, RequestPayload};
pub use error::{RpcError, RpcResult, SerializedError};
pub use framing::Side;
pub use registry::{decode_arg, Actor, ActorRegistry};
pub use responsiveness::{MonitorConfig, ResponsiveState, ResponsivenessMonitor};
pub use rpc::{json_reply, HandlerFault, RemoteProxy, RpcConfig, RpcProtocol};

// Re-exported so actor implementations share one version of these
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
