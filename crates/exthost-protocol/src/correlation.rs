//! Bookkeeping for in-flight calls in both directions
//!
//! Outbound calls live in [`PendingCalls`] until a reply, a local
//! cancellation or a drop of the caller's [`PendingReply`] removes them.
//! Inbound calls live in [`InboundCalls`] only while their handler runs, so
//! a Cancel that arrives after the reply finds nothing and is a no-op.

use crate::envelope::{ActorId, RequestId};
use crate::error::{RpcError, RpcResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// An outbound call awaiting its reply
pub(crate) struct PendingCall {
    tx: oneshot::Sender<RpcResult<Value>>,
    /// Fires once the call has left the table for any reason
    settled: CancellationToken,
}

impl PendingCall {
    fn settle(self, result: RpcResult<Value>) {
        self.settled.cancel();
        // The caller may have stopped waiting
        let _ = self.tx.send(result);
    }
}

/// Outbound calls keyed by request id
#[derive(Default)]
pub struct PendingCalls {
    calls: DashMap<RequestId, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call and return the caller's handle plus a token that fires
    /// when the call settles
    pub(crate) fn insert(
        self: &Arc<Self>,
        request_id: RequestId,
    ) -> (PendingReply, CancellationToken) {
        let (tx, rx) = oneshot::channel();
        let settled = CancellationToken::new();
        self.calls.insert(
            request_id,
            PendingCall {
                tx,
                settled: settled.clone(),
            },
        );
        let reply = PendingReply {
            request_id,
            state: ReplyState::Waiting(rx),
            table: Arc::downgrade(self),
        };
        (reply, settled)
    }

    /// Settle the call with the given result
    ///
    /// Returns `false` when no call is pending under this id, which is the
    /// case for duplicate replies and replies to locally cancelled calls.
    pub fn resolve(&self, request_id: RequestId, result: RpcResult<Value>) -> bool {
        match self.calls.remove(&request_id) {
            Some((_, call)) => {
                call.settle(result);
                true
            }
            None => false,
        }
    }

    /// Forget a call without notifying its caller
    pub fn discard(&self, request_id: RequestId) -> bool {
        match self.calls.remove(&request_id) {
            Some((_, call)) => {
                call.settled.cancel();
                true
            }
            None => false,
        }
    }

    /// Fail every pending call with the given error
    pub fn fail_all(&self, error: RpcError) -> usize {
        let ids: Vec<RequestId> = self.calls.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(*id, Err(error.clone())))
            .count()
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.calls.contains_key(&request_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

enum ReplyState {
    Waiting(oneshot::Receiver<RpcResult<Value>>),
    Failed(Option<RpcError>),
}

/// Awaitable result of an outbound call
///
/// Resolves exactly once. Dropping it before the reply arrives removes the
/// pending entry so a late reply is discarded.
#[must_use = "the reply is discarded unless awaited"]
pub struct PendingReply {
    request_id: RequestId,
    state: ReplyState,
    table: Weak<PendingCalls>,
}

impl PendingReply {
    /// A reply that fails immediately without touching any table
    pub(crate) fn failed(error: RpcError) -> Self {
        Self {
            request_id: crate::envelope::NO_REQUEST_ID,
            state: ReplyState::Failed(Some(error)),
            table: Weak::new(),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Await the reply and deserialize it
    pub async fn decode<T: serde::de::DeserializeOwned>(self) -> RpcResult<T> {
        let value = self.await?;
        serde_json::from_value(value)
            .map_err(|e| RpcError::protocol(format!("Unexpected reply shape: {}", e)))
    }
}

impl Future for PendingReply {
    type Output = RpcResult<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            ReplyState::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                // Sender dropped without settling: the table went away
                Poll::Ready(Err(_)) => Poll::Ready(Err(RpcError::Cancelled)),
                Poll::Pending => Poll::Pending,
            },
            ReplyState::Failed(error) => {
                Poll::Ready(Err(error.take().unwrap_or(RpcError::Cancelled)))
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if let Some(table) = self.table.upgrade() {
            table.discard(self.request_id);
        }
    }
}

/// A request being executed by a local actor
#[derive(Debug)]
pub(crate) struct InboundCall {
    pub actor: ActorId,
    pub method: String,
    /// Present only when the caller allowed cancellation
    pub cancellation: Option<CancellationToken>,
}

/// Inbound calls keyed by the peer's request id
#[derive(Default)]
pub(crate) struct InboundCalls {
    calls: DashMap<RequestId, InboundCall>,
}

impl InboundCalls {
    /// Record a call; `false` if one is already executing under this id
    pub fn begin(&self, request_id: RequestId, call: InboundCall) -> bool {
        match self.calls.entry(request_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(call);
                true
            }
        }
    }

    /// Trigger cancellation for a running call; `false` if nothing was cancelled
    pub fn cancel(&self, request_id: RequestId) -> bool {
        match self.calls.get(&request_id) {
            Some(call) => match &call.cancellation {
                Some(token) => {
                    token.cancel();
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn finish(&self, request_id: RequestId) -> Option<InboundCall> {
        self.calls.remove(&request_id).map(|(_, call)| call)
    }

    /// Cancel every running call that accepts cancellation
    pub fn cancel_all(&self) {
        for call in self.calls.iter() {
            if let Some(token) = &call.cancellation {
                token.cancel();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_resolve_settles_once() {
        let table = Arc::new(PendingCalls::new());
        let (reply, settled) = table.insert(1);

        assert!(table.resolve(1, Ok(json!("pong"))));
        assert!(!table.resolve(1, Ok(json!("again"))));
        assert!(settled.is_cancelled());
        assert_eq!(reply.await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn test_drop_removes_pending_entry() {
        let table = Arc::new(PendingCalls::new());
        let (reply, settled) = table.insert(4);
        assert!(table.contains(4));

        drop(reply);
        assert!(!table.contains(4));
        assert!(settled.is_cancelled());
        assert!(!table.resolve(4, Ok(Value::Null)));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = Arc::new(PendingCalls::new());
        let (first, _) = table.insert(1);
        let (second, _) = table.insert(2);

        assert_eq!(table.fail_all(RpcError::Cancelled), 2);
        assert!(table.is_empty());
        assert!(first.await.unwrap_err().is_cancelled());
        assert!(second.await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_failed_reply_resolves_immediately() {
        let reply = PendingReply::failed(RpcError::NotRemotable {
            method: "dispose".to_string(),
        });
        assert!(matches!(
            reply.await,
            Err(RpcError::NotRemotable { .. })
        ));
    }

    #[test]
    fn test_inbound_duplicates_and_cancel() {
        let calls = InboundCalls::default();
        let token = CancellationToken::new();
        let call = |cancellation| InboundCall {
            actor: ActorId::Number(1),
            method: "$work".to_string(),
            cancellation,
        };

        assert!(calls.begin(5, call(Some(token.clone()))));
        assert!(!calls.begin(5, call(None)));
        assert!(calls.cancel(5));
        assert!(token.is_cancelled());

        assert!(calls.finish(5).is_some());
        assert!(!calls.cancel(5));

        assert!(calls.begin(6, call(None)));
        assert!(!calls.cancel(6));
        assert_eq!(calls.len(), 1);
    }
}
