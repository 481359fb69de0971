//! Shared test utilities

#![allow(dead_code)]

use exthost_lifecycle::{LifecycleOptions, LifecycleResult, PluginHost, ShutdownCoordinator};
use exthost_protocol::{
    async_trait, Actor, CancellationToken, Envelope, EnvelopeChannel, EnvelopeReceiver,
    EnvelopeSender, MessageKind, Reply, RpcError, RpcResult,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Plugin host connecting in the background, scripted host end
pub struct Harness {
    pub connect: JoinHandle<LifecycleResult<PluginHost>>,
    pub shutdown: ShutdownCoordinator,
    pub tx: EnvelopeSender,
    pub rx: EnvelopeReceiver,
}

pub fn spawn_plugin_host(options: LifecycleOptions) -> Harness {
    let ((host_tx, host_rx), (plugin_tx, plugin_rx)) = EnvelopeChannel::in_memory();
    let shutdown = ShutdownCoordinator::new();
    let connect = tokio::spawn(PluginHost::connect(
        plugin_tx,
        plugin_rx,
        options,
        shutdown.clone(),
    ));
    Harness {
        connect,
        shutdown,
        tx: host_tx,
        rx: host_rx,
    }
}

impl Harness {
    /// Drive the host half of the handshake and return the connected plugin host
    pub async fn handshake(&mut self, init_data: Value) -> PluginHost {
        assert_eq!(next(&mut self.rx).await.kind, MessageKind::Ready);
        self.tx
            .send(Envelope::with_payload(MessageKind::InitData, init_data));
        assert_eq!(next(&mut self.rx).await.kind, MessageKind::Initialized);
        (&mut self.connect)
            .await
            .expect("connect task panicked")
            .expect("handshake failed")
    }
}

pub fn init_data() -> Value {
    json!({
        "extensions": [
            { "identifier": "oni-test", "extensionLocationPath": "/plugins/oni-test" }
        ],
        "environment": { "appRootPath": "/opt/oni" },
        "logLevel": 2,
        "autoStart": true
    })
}

/// Next envelope from the plugin host, failing the test after a generous timeout
pub async fn next(rx: &mut EnvelopeReceiver) -> Envelope {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for envelope")
        .expect("channel closed")
}

/// Assert nothing arrives within a short window
pub async fn assert_quiet(rx: &mut EnvelopeReceiver) {
    let result = tokio::time::timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "unexpected envelope: {:?}", result);
}

/// Actor whose deactivation hook takes `teardown`
pub struct PluginActor {
    pub teardown: Duration,
    pub deactivated: AtomicBool,
}

impl PluginActor {
    pub fn new(teardown: Duration) -> Self {
        Self {
            teardown,
            deactivated: AtomicBool::new(false),
        }
    }

    pub fn was_deactivated(&self) -> bool {
        self.deactivated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Actor for PluginActor {
    async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> RpcResult<Reply> {
        match method {
            "$ping" => Ok(Reply::Json(json!("pong"))),
            "$echo" => Ok(Reply::Json(args.into_iter().next().unwrap_or(Value::Null))),
            "$waitForCancel" => {
                cancellation.cancelled().await;
                Err(RpcError::Cancelled)
            }
            "$panic" => panic!("boom"),
            other => Err(RpcError::unknown_method(other)),
        }
    }

    async fn deactivate(&self) {
        self.deactivated.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.teardown).await;
    }
}

pub fn assert_elapsed_near(started: tokio::time::Instant, expected: Duration) {
    let elapsed = started.elapsed();
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "elapsed {:?}, expected about {:?}",
        elapsed,
        expected
    );
}
