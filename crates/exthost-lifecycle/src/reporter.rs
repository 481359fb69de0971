//! Forwarding of unexpected errors to the host
//!
//! Errors are attributed to a plugin when the failing actor is bound to one,
//! or when one of the plugin locations from the init data shows up in the
//! error's trace. Attributed errors go to
//! `MainThreadExtensionService.$onExtensionRuntimeError`, everything else to
//! `MainThreadErrors.$onUnexpectedError`.

use crate::init_data::InitData;
use crate::shutdown::ShutdownCoordinator;
use exthost_protocol::{ActorId, HandlerFault, RpcError, RpcProtocol, SerializedError};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

pub const MAIN_THREAD_ERRORS: &str = "MainThreadErrors";
pub const MAIN_THREAD_EXTENSION_SERVICE: &str = "MainThreadExtensionService";

/// Plugin locations and actor bindings used to attribute errors
#[derive(Debug, Clone, Default)]
pub struct PluginPathIndex {
    /// `(location, identifier)`
    entries: Vec<(String, String)>,
    actors: HashMap<ActorId, String>,
}

impl PluginPathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_init_data(init_data: &InitData) -> Self {
        let mut index = Self::new();
        for (identifier, location) in init_data.plugin_locations() {
            index.insert(location.to_string_lossy(), identifier);
        }
        index
    }

    pub fn insert(&mut self, location: impl Into<String>, identifier: impl Into<String>) {
        let location = location.into();
        if location.is_empty() {
            return;
        }
        self.entries.push((location, identifier.into()));
    }

    /// Plugin owning the first trace frame that names a known location
    ///
    /// Within one frame the longest matching location wins, so nested
    /// plugin folders resolve to the innermost plugin.
    pub fn find(&self, trace: &str) -> Option<&str> {
        trace.lines().find_map(|frame| {
            self.entries
                .iter()
                .filter(|(location, _)| frame.contains(location.as_str()))
                .max_by_key(|(location, _)| location.len())
                .map(|(_, identifier)| identifier.as_str())
        })
    }

    /// Attribute faults raised by `actor` to the plugin `identifier`
    pub fn bind_actor(&mut self, actor: impl Into<ActorId>, identifier: impl Into<String>) {
        self.actors.insert(actor.into(), identifier.into());
    }

    pub fn find_actor(&self, actor: &ActorId) -> Option<&str> {
        self.actors.get(actor).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Where a report was sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportTarget {
    Plugin(String),
    Unattributed,
    /// Dropped because the plugin host is shutting down
    Suppressed,
}

/// Structured replacement for a process-wide unexpected-error handler
#[derive(Clone)]
pub struct ErrorReporter {
    rpc: RpcProtocol,
    index: Arc<PluginPathIndex>,
    shutdown: ShutdownCoordinator,
}

impl ErrorReporter {
    pub fn new(rpc: RpcProtocol, index: PluginPathIndex, shutdown: ShutdownCoordinator) -> Self {
        Self {
            rpc,
            index: Arc::new(index),
            shutdown,
        }
    }

    /// Forward an error to the host, attributed by its trace
    pub fn report(&self, error: &RpcError) -> ReportTarget {
        self.send(error, self.index.find(trace_of(error)))
    }

    /// Forward a handler fault, attributed by its actor before its trace
    pub fn report_fault(&self, fault: &HandlerFault) -> ReportTarget {
        let plugin = self
            .index
            .find_actor(&fault.actor)
            .or_else(|| self.index.find(trace_of(&fault.error)));
        self.send(&fault.error, plugin)
    }

    fn send(&self, error: &RpcError, plugin: Option<&str>) -> ReportTarget {
        if self.shutdown.is_terminating() {
            debug!(error = %error, "Suppressing error report during shutdown");
            return ReportTarget::Suppressed;
        }

        let data = match serde_json::to_value(SerializedError::from_error(error)) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode error report");
                Value::Null
            }
        };

        match plugin {
            Some(plugin) => {
                warn!(plugin = %plugin, error = %error, "Plugin runtime error");
                // Fire and forget: the reply carries nothing
                let _ = self
                    .rpc
                    .get_proxy(MAIN_THREAD_EXTENSION_SERVICE)
                    .call("$onExtensionRuntimeError", vec![json!(plugin), data]);
                ReportTarget::Plugin(plugin.to_string())
            }
            None => {
                warn!(error = %error, "Unexpected error");
                let _ = self
                    .rpc
                    .get_proxy(MAIN_THREAD_ERRORS)
                    .call("$onUnexpectedError", vec![data]);
                ReportTarget::Unattributed
            }
        }
    }

    /// Report every handler fault raised by the RPC core until shutdown
    ///
    /// Subscribes immediately, so faults raised before the returned future is
    /// first polled are not lost.
    pub fn forward_faults(self) -> impl Future<Output = ()> + Send + 'static {
        let mut faults = self.rpc.subscribe_faults();
        async move {
            loop {
                tokio::select! {
                    fault = faults.recv() => match fault {
                        Ok(fault) => {
                            self.report_fault(&fault);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Dropped handler fault reports");
                        }
                        Err(RecvError::Closed) => return,
                    },
                    _ = self.shutdown.termination_requested() => return,
                }
            }
        }
    }
}

fn trace_of(error: &RpcError) -> &str {
    match error {
        RpcError::Remote {
            stack: Some(stack),
            ..
        } => stack.as_str(),
        _ => "",
    }
}
