//! Host side of the handshake
//!
//! Used by embedders that launch a plugin host and by the integration tests.

use crate::error::{LifecycleError, LifecycleResult};
use crate::init_data::InitData;
use exthost_protocol::{
    Envelope, EnvelopeReceiver, EnvelopeSender, MessageKind, RpcConfig, RpcProtocol,
};
use tracing::{debug, info, warn};

/// Connection from the host to one plugin host
pub struct HostConnection {
    sender: EnvelopeSender,
    receiver: Option<EnvelopeReceiver>,
    rpc: RpcProtocol,
}

impl HostConnection {
    pub fn new(sender: EnvelopeSender, receiver: EnvelopeReceiver, config: RpcConfig) -> Self {
        let rpc = RpcProtocol::new(sender.clone(), config);
        Self {
            sender,
            receiver: Some(receiver),
            rpc,
        }
    }

    /// RPC core for this connection; register host-side actors before
    /// [`HostConnection::initialize`]
    pub fn rpc(&self) -> &RpcProtocol {
        &self.rpc
    }

    /// Wait for Ready, send the init data, wait for Initialized and start
    /// dispatching
    pub async fn initialize(&mut self, init_data: &InitData) -> LifecycleResult<()> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(LifecycleError::handshake("Connection already initialized"));
        };

        expect_kind(&mut receiver, MessageKind::Ready).await?;
        debug!("Plugin host is ready, sending init data");

        let payload = serde_json::to_value(init_data)
            .map_err(|e| LifecycleError::handshake(format!("Unserializable init data: {}", e)))?;
        self.sender
            .send(Envelope::with_payload(MessageKind::InitData, payload));

        expect_kind(&mut receiver, MessageKind::Initialized).await?;
        info!("Plugin host initialized");

        tokio::spawn({
            let rpc = self.rpc.clone();
            async move { rpc.serve(receiver).await }
        });
        Ok(())
    }

    /// Ask the plugin host to shut down
    pub fn terminate(&self) {
        self.sender.send(Envelope::of_kind(MessageKind::Terminate));
    }

    /// Resolves once the channel closed from either end
    pub async fn closed(&self) {
        self.sender.closed().await
    }
}

async fn expect_kind(receiver: &mut EnvelopeReceiver, kind: MessageKind) -> LifecycleResult<()> {
    loop {
        let Some(envelope) = receiver.recv().await else {
            return Err(LifecycleError::ChannelClosed);
        };
        if envelope.kind == kind {
            return Ok(());
        }
        warn!(
            expected = ?kind,
            received = ?envelope.kind,
            "Ignoring envelope during handshake"
        );
    }
}
