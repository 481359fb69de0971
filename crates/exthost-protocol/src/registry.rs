//! Actor registry: local actors by id, and cached proxies to remote ones

use crate::envelope::{ActorId, Reply};
use crate::error::{RpcError, RpcResult};
use crate::rpc::RemoteProxy;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A local object exposed for remote invocation
///
/// Implementations dispatch on `method` and return
/// [`RpcError::UnknownMethod`] for names they do not handle.
#[async_trait]
pub trait Actor: Send + Sync {
    /// Invoke a remotely callable method
    ///
    /// `cancellation` fires when the caller sent a Cancel for this call. It
    /// never fires for requests that were sent without cancellation support.
    async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
        cancellation: CancellationToken,
    ) -> RpcResult<Reply>;

    /// Release resources before the process exits
    async fn deactivate(&self) {}
}

/// Decode the argument at `index`, treating a missing argument as `null`
pub fn decode_arg<T: DeserializeOwned>(method: &str, args: &[Value], index: usize) -> RpcResult<T> {
    let value = args.get(index).cloned().unwrap_or(Value::Null);
    serde_json::from_value(value).map_err(|e| {
        RpcError::invalid_arguments(method, format!("argument {}: {}", index, e))
    })
}

/// Maps actor ids to local instances and to remote proxies
#[derive(Default)]
pub struct ActorRegistry {
    locals: DashMap<ActorId, Arc<dyn Actor>>,
    proxies: DashMap<ActorId, Arc<RemoteProxy>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a local actor; fails if the id is taken
    pub fn register_local(&self, id: impl Into<ActorId>, actor: Arc<dyn Actor>) -> RpcResult<()> {
        let id = id.into();
        match self.locals.entry(id) {
            Entry::Occupied(entry) => Err(RpcError::Conflict {
                actor: entry.key().to_string(),
            }),
            Entry::Vacant(entry) => {
                debug!(actor = %entry.key(), "Registered local actor");
                entry.insert(actor);
                Ok(())
            }
        }
    }

    /// Look up a local actor
    pub fn get_local(&self, id: &ActorId) -> RpcResult<Arc<dyn Actor>> {
        self.locals
            .get(id)
            .map(|actor| actor.value().clone())
            .ok_or_else(|| RpcError::UnknownActor {
                actor: id.to_string(),
            })
    }

    /// Fail with the first id that has no local actor
    pub fn assert_registered(&self, ids: &[ActorId]) -> RpcResult<()> {
        match ids.iter().find(|id| !self.locals.contains_key(*id)) {
            Some(missing) => Err(RpcError::UnknownActor {
                actor: missing.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Proxy for `id`, created on first use and cached afterwards
    pub fn get_proxy_with(
        &self,
        id: ActorId,
        create: impl FnOnce(ActorId) -> RemoteProxy,
    ) -> Arc<RemoteProxy> {
        self.proxies
            .entry(id.clone())
            .or_insert_with(|| Arc::new(create(id)))
            .value()
            .clone()
    }

    /// Run every local actor's teardown hook concurrently
    pub async fn deactivate_all(&self) {
        let actors: Vec<(ActorId, Arc<dyn Actor>)> = self
            .locals
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        debug!(count = actors.len(), "Deactivating local actors");
        futures::future::join_all(actors.into_iter().map(|(id, actor)| async move {
            actor.deactivate().await;
            debug!(actor = %id, "Actor deactivated");
        }))
        .await;
    }
}
