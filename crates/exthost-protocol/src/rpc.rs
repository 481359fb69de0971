//! Bidirectional RPC core
//!
//! [`RpcProtocol`] sits on top of an envelope channel. Outbound calls go
//! through [`RemoteProxy`] handles and are correlated by request id; inbound
//! requests are acknowledged immediately, then dispatched to local actors on
//! their own task so a slow handler never stalls the receive path.

use crate::channel::{EnvelopeReceiver, EnvelopeSender};
use crate::correlation::{InboundCall, InboundCalls, PendingCalls, PendingReply};
use crate::envelope::{ActorId, Envelope, MessageKind, Reply, RequestId, RequestPayload};
use crate::error::{RpcError, RpcResult, SerializedError};
use crate::registry::{Actor, ActorRegistry};
use crate::responsiveness::{MonitorConfig, ResponsiveState, ResponsivenessMonitor};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Prefix that marks a method as remotely invocable
pub const REMOTE_METHOD_PREFIX: char = '$';

const FAULT_CAPACITY: usize = 64;

/// Tunables for one RPC core instance
#[derive(Debug, Clone, Copy)]
pub struct RpcConfig {
    /// First request id handed out for outbound calls
    pub first_request_id: RequestId,
    pub monitor: MonitorConfig,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            first_request_id: 1,
            monitor: MonitorConfig::default(),
        }
    }
}

/// Failure that escaped an actor handler, published for error reporting
#[derive(Debug, Clone)]
pub struct HandlerFault {
    pub actor: ActorId,
    pub method: String,
    pub error: RpcError,
}

struct RpcInner {
    sender: EnvelopeSender,
    registry: ActorRegistry,
    pending: Arc<PendingCalls>,
    inbound: InboundCalls,
    next_id: AtomicI64,
    monitor: ResponsivenessMonitor,
    disposed: CancellationToken,
    faults: broadcast::Sender<HandlerFault>,
}

/// RPC core bound to one envelope channel
#[derive(Clone)]
pub struct RpcProtocol {
    inner: Arc<RpcInner>,
}

impl RpcProtocol {
    pub fn new(sender: EnvelopeSender, config: RpcConfig) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CAPACITY);
        Self {
            inner: Arc::new(RpcInner {
                sender,
                registry: ActorRegistry::new(),
                pending: Arc::new(PendingCalls::new()),
                inbound: InboundCalls::default(),
                next_id: AtomicI64::new(config.first_request_id),
                monitor: ResponsivenessMonitor::new(config.monitor),
                disposed: CancellationToken::new(),
                faults,
            }),
        }
    }

    pub fn registry(&self) -> &ActorRegistry {
        &self.inner.registry
    }

    /// Expose a local actor to the peer
    pub fn register_local(&self, id: impl Into<ActorId>, actor: Arc<dyn Actor>) -> RpcResult<()> {
        self.inner.registry.register_local(id, actor)
    }

    /// Cached proxy for the peer's actor `id`
    pub fn get_proxy(&self, id: impl Into<ActorId>) -> Arc<RemoteProxy> {
        let rpc = Arc::downgrade(&self.inner);
        self.inner
            .registry
            .get_proxy_with(id.into(), move |id| RemoteProxy { id, rpc })
    }

    pub fn responsive_state(&self) -> ResponsiveState {
        self.inner.monitor.state()
    }

    pub fn subscribe_responsiveness(&self) -> broadcast::Receiver<ResponsiveState> {
        self.inner.monitor.subscribe()
    }

    /// Faults (panics) raised by local actor handlers
    pub fn subscribe_faults(&self) -> broadcast::Receiver<HandlerFault> {
        self.inner.faults.subscribe()
    }

    /// Number of outbound calls still waiting for a reply
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of inbound calls whose handler is still running
    pub fn running_calls(&self) -> usize {
        self.inner.inbound.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.is_cancelled()
    }

    /// Process envelopes until the channel closes or the core is disposed
    pub async fn serve(&self, mut receiver: EnvelopeReceiver) {
        loop {
            tokio::select! {
                message = receiver.recv() => match message {
                    Some(envelope) => self.receive(envelope),
                    None => break,
                },
                _ = self.inner.disposed.cancelled() => return,
            }
        }
        self.on_channel_closed();
    }

    /// Fail outstanding calls after the transport went away
    pub fn on_channel_closed(&self) {
        let failed = self
            .inner
            .pending
            .fail_all(RpcError::channel_closed("connection to peer lost"));
        if failed > 0 {
            debug!(failed, "Failed pending calls after channel close");
        }
        self.inner.monitor.dispose();
    }

    /// Stop dispatching, fail every pending call and cancel running handlers
    pub fn dispose(&self) {
        if self.inner.disposed.is_cancelled() {
            return;
        }
        self.inner.disposed.cancel();
        let failed = self.inner.pending.fail_all(RpcError::Cancelled);
        self.inner.inbound.cancel_all();
        self.inner.monitor.dispose();
        debug!(failed, "RPC core disposed");
    }

    /// Handle one envelope from the peer
    pub fn receive(&self, envelope: Envelope) {
        let request_id = envelope.request_id;
        match envelope.kind {
            kind if kind.is_request() => self.receive_request(envelope),
            MessageKind::Acknowledged => {
                trace!(request_id, "Request acknowledged");
                self.inner.monitor.on_acknowledged();
            }
            MessageKind::Cancel => {
                if self.inner.inbound.cancel(request_id) {
                    debug!(request_id, "Cancelled inbound call");
                } else {
                    trace!(request_id, "Cancel for finished or non-cancellable call");
                }
            }
            MessageKind::ReplyOkEmpty => self.settle(request_id, Ok(Value::Null)),
            MessageKind::ReplyOkBuffer | MessageKind::ReplyOkJson => {
                self.settle(request_id, Ok(envelope.payload))
            }
            MessageKind::ReplyErrError => {
                self.settle(request_id, Err(SerializedError::revive(&envelope.payload)))
            }
            MessageKind::ReplyErrEmpty => self.settle(
                request_id,
                Err(RpcError::remote("Error", "Remote call failed without details")),
            ),
            kind => {
                debug!(?kind, "Ignoring lifecycle envelope in RPC core");
            }
        }
    }

    fn settle(&self, request_id: RequestId, result: RpcResult<Value>) {
        if !self.inner.pending.resolve(request_id, result) {
            trace!(request_id, "Discarding reply for unknown request");
        }
    }

    fn receive_request(&self, envelope: Envelope) {
        let request_id = envelope.request_id;
        if self.is_disposed() {
            debug!(request_id, "Dropping request received after dispose");
            return;
        }

        let payload: RequestPayload = match serde_json::from_value(envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(request_id, error = %e, "Malformed request payload");
                let error = RpcError::protocol(format!("Malformed request payload: {}", e));
                // Still acknowledged, so the peer's monitor does not wait on it
                self.inner.sender.send(Envelope::acknowledge(request_id));
                self.inner.sender.send(Envelope::reply_error(
                    request_id,
                    Some(SerializedError::from_error(&error)),
                ));
                return;
            }
        };

        let cancellation = envelope.kind.is_cancellable().then(CancellationToken::new);
        let call = InboundCall {
            actor: payload.actor.clone(),
            method: payload.method.clone(),
            cancellation: cancellation.clone(),
        };
        if !self.inner.inbound.begin(request_id, call) {
            warn!(
                request_id,
                actor = %payload.actor,
                method = %payload.method,
                "Dropping request reusing the id of a running call"
            );
            return;
        }

        self.inner.sender.send(Envelope::acknowledge(request_id));
        tokio::spawn(Arc::clone(&self.inner).dispatch(request_id, payload, cancellation));
    }
}

impl RpcInner {
    async fn dispatch(
        self: Arc<Self>,
        request_id: RequestId,
        payload: RequestPayload,
        cancellation: Option<CancellationToken>,
    ) {
        let RequestPayload {
            actor,
            method,
            args,
        } = payload;
        trace!(request_id, actor = %actor, method = %method, "Dispatching request");

        // A token nobody cancels for callers that did not opt in
        let token = cancellation.unwrap_or_default();
        let outcome = match self.registry.get_local(&actor) {
            Ok(target) => AssertUnwindSafe(target.invoke(&method, args, token))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(self.handler_panicked(&actor, &method, panic))),
            Err(e) => Err(e),
        };

        self.inbound.finish(request_id);

        let envelope = match outcome {
            Ok(reply) => Envelope::reply(request_id, reply),
            Err(e) => {
                debug!(request_id, actor = %actor, method = %method, error = %e, "Request failed");
                Envelope::reply_error(request_id, Some(SerializedError::from_error(&e)))
            }
        };
        self.sender.send(envelope);
    }

    fn handler_panicked(
        &self,
        actor: &ActorId,
        method: &str,
        panic: Box<dyn Any + Send>,
    ) -> RpcError {
        let error = RpcError::remote("Panic", panic_message(panic.as_ref()));
        error!(
            error_category = "actor_handler",
            actor = %actor,
            method = %method,
            error = %error,
            "Actor handler panicked"
        );
        let _ = self.faults.send(HandlerFault {
            actor: actor.clone(),
            method: method.to_string(),
            error: error.clone(),
        });
        error
    }

    fn start_call(
        self: &Arc<Self>,
        actor: &ActorId,
        method: &str,
        args: Vec<Value>,
        cancellation: Option<CancellationToken>,
    ) -> PendingReply {
        if !method.starts_with(REMOTE_METHOD_PREFIX) {
            return PendingReply::failed(RpcError::NotRemotable {
                method: method.to_string(),
            });
        }
        if self.disposed.is_cancelled() {
            return PendingReply::failed(RpcError::Cancelled);
        }
        if self.sender.is_closed() {
            return PendingReply::failed(RpcError::channel_closed("connection to peer lost"));
        }
        if cancellation.as_ref().is_some_and(|token| token.is_cancelled()) {
            return PendingReply::failed(RpcError::Cancelled);
        }

        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply, settled) = self.pending.insert(request_id);
        trace!(request_id, actor = %actor, method = %method, "Sending request");

        self.monitor.on_will_send_request();
        self.sender.send(Envelope::request(
            request_id,
            cancellation.is_some(),
            RequestPayload {
                actor: actor.clone(),
                method: method.to_string(),
                args,
            },
        ));

        if let Some(token) = cancellation {
            let rpc = Arc::downgrade(self);
            tokio::spawn(async move {
                tokio::select! {
                    _ = settled.cancelled() => {}
                    _ = token.cancelled() => {
                        let Some(rpc) = rpc.upgrade() else { return };
                        if rpc.pending.resolve(request_id, Err(RpcError::Cancelled)) {
                            debug!(request_id, "Cancelling outbound call");
                            rpc.sender.send(Envelope::cancel(request_id));
                        }
                    }
                }
            });
        }

        reply
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Handle for calling methods on one of the peer's actors
pub struct RemoteProxy {
    id: ActorId,
    rpc: Weak<RpcInner>,
}

impl RemoteProxy {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Call `method` without cancellation support
    ///
    /// The request is sent before this returns. Methods must carry the `$`
    /// prefix; anything else fails locally with [`RpcError::NotRemotable`].
    pub fn call(&self, method: &str, args: Vec<Value>) -> PendingReply {
        self.start(method, args, None)
    }

    /// Call `method`; cancelling `cancellation` sends a Cancel to the peer
    pub fn call_cancellable(
        &self,
        method: &str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> PendingReply {
        self.start(method, args, Some(cancellation))
    }

    fn start(
        &self,
        method: &str,
        args: Vec<Value>,
        cancellation: Option<CancellationToken>,
    ) -> PendingReply {
        match self.rpc.upgrade() {
            Some(rpc) => rpc.start_call(&self.id, method, args, cancellation),
            None => PendingReply::failed(RpcError::Cancelled),
        }
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy").field("id", &self.id).finish()
    }
}

/// Convenience for actors that only return JSON
pub fn json_reply<T: serde::Serialize>(value: T) -> RpcResult<Reply> {
    serde_json::to_value(value)
        .map(Reply::Json)
        .map_err(|e| RpcError::protocol(format!("Failed to encode reply: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::EnvelopeChannel;
    use serde_json::json;

    #[tokio::test]
    async fn test_non_remotable_method_is_rejected_locally() {
        let ((host_tx, _host_rx), (_plugin_tx, mut plugin_rx)) = EnvelopeChannel::in_memory();
        let rpc = RpcProtocol::new(host_tx, RpcConfig::default());

        let err = rpc.get_proxy(7).call("ping", vec![]).await.unwrap_err();
        assert!(matches!(err, RpcError::NotRemotable { .. }));
        assert_eq!(rpc.pending_calls(), 0);

        // Nothing reached the peer
        assert!(plugin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_proxy_is_cached_per_id() {
        let ((host_tx, _host_rx), _plugin) = EnvelopeChannel::in_memory();
        let rpc = RpcProtocol::new(host_tx, RpcConfig::default());

        let a = rpc.get_proxy("MainThreadErrors");
        let b = rpc.get_proxy("MainThreadErrors");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &rpc.get_proxy(3)));
    }

    #[tokio::test]
    async fn test_pre_cancelled_call_sends_nothing() {
        let ((host_tx, _host_rx), (_plugin_tx, mut plugin_rx)) = EnvelopeChannel::in_memory();
        let rpc = RpcProtocol::new(host_tx, RpcConfig::default());

        let token = CancellationToken::new();
        token.cancel();
        let err = rpc
            .get_proxy(1)
            .call_cancellable("$work", vec![json!(1)], token)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        tokio::task::yield_now().await;
        assert!(plugin_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dispose_fails_pending_and_refuses_new_calls() {
        let ((host_tx, _host_rx), _plugin) = EnvelopeChannel::in_memory();
        let rpc = RpcProtocol::new(host_tx, RpcConfig::default());

        let pending = rpc.get_proxy(1).call("$slow", vec![]);
        assert_eq!(rpc.pending_calls(), 1);

        rpc.dispose();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert!(rpc
            .get_proxy(1)
            .call("$slow", vec![])
            .await
            .unwrap_err()
            .is_cancelled());
    }

    #[tokio::test]
    async fn test_reply_error_empty_fails_call() {
        let ((host_tx, _host_rx), _plugin) = EnvelopeChannel::in_memory();
        let rpc = RpcProtocol::new(
            host_tx,
            RpcConfig {
                first_request_id: 100,
                ..RpcConfig::default()
            },
        );

        let pending = rpc.get_proxy(1).call("$x", vec![]);
        assert_eq!(pending.request_id(), 100);
        rpc.receive(Envelope::reply_error(100, None));
        assert!(matches!(pending.await, Err(RpcError::Remote { .. })));
    }

    #[test]
    fn test_panic_message_extraction() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
        let boxed: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(boxed.as_ref()), "handler panicked");
    }
}
