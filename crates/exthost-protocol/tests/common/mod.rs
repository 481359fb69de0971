//! Shared test utilities

#![allow(dead_code)]

use exthost_protocol::{
    async_trait, decode_arg, Actor, CancellationToken, Envelope, EnvelopeChannel,
    EnvelopeReceiver, EnvelopeSender, Reply, RpcConfig, RpcError, RpcProtocol, RpcResult,
};
use serde_json::{json, Value};
use std::time::Duration;

/// RPC core on the host end, scripted raw envelopes on the plugin-host end
pub struct RawPeer {
    pub rpc: RpcProtocol,
    pub tx: EnvelopeSender,
    pub rx: EnvelopeReceiver,
}

pub fn rpc_with_raw_peer() -> RawPeer {
    let ((host_tx, host_rx), (plugin_tx, plugin_rx)) = EnvelopeChannel::in_memory();
    let rpc = RpcProtocol::new(host_tx, RpcConfig::default());
    tokio::spawn({
        let rpc = rpc.clone();
        async move { rpc.serve(host_rx).await }
    });
    RawPeer {
        rpc,
        tx: plugin_tx,
        rx: plugin_rx,
    }
}

/// Two RPC cores talking to each other, host end first
pub fn rpc_pair() -> (RpcProtocol, RpcProtocol) {
    let ((host_tx, host_rx), (plugin_tx, plugin_rx)) = EnvelopeChannel::in_memory();
    let host = RpcProtocol::new(host_tx, RpcConfig::default());
    let plugin = RpcProtocol::new(plugin_tx, RpcConfig::default());
    tokio::spawn({
        let host = host.clone();
        async move { host.serve(host_rx).await }
    });
    tokio::spawn({
        let plugin = plugin.clone();
        async move { plugin.serve(plugin_rx).await }
    });
    (host, plugin)
}

/// Next envelope from the peer, failing the test after a generous timeout
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

/// Actor with a handful of test methods
pub struct TestActor;

#[async_trait]
impl Actor for TestActor {
    async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> RpcResult<Reply> {
        match method {
            "$ping" => Ok(Reply::Json(json!("pong"))),
            "$echo" => Ok(Reply::Json(args.into_iter().next().unwrap_or(Value::Null))),
            "$delayedEcho" => {
                let delay: u64 = decode_arg(method, &args, 1)?;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Reply::Json(args[0].clone()))
            }
            "$waitForCancel" => {
                cancellation.cancelled().await;
                Err(RpcError::Cancelled)
            }
            "$bytes" => Ok(Reply::Buffer(vec![1, 2, 3])),
            "$nothing" => Ok(Reply::Empty),
            "$fail" => Err(RpcError::remote("TypeError", "x is undefined")),
            "$panic" => panic!("boom"),
            other => Err(RpcError::unknown_method(other)),
        }
    }
}
