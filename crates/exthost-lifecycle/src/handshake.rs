//! Plugin-host side of the startup handshake and the lifecycle that follows
//!
//! ```text
//! AwaitingReady --send Ready--> AwaitingInitData --init data--> Initialized
//!       |                              |                            |
//!       +---------- Terminate ---------+--> Terminated              |
//!                                                Terminate / orphan / close
//!                                                                   v
//!                                  Terminated <-- deactivate -- Terminating
//! ```
//!
//! Terminate is handled by the router ahead of any RPC dispatch, in every
//! state.

use crate::error::{LifecycleError, LifecycleResult};
use crate::init_data::InitData;
use crate::reporter::{ErrorReporter, PluginPathIndex};
use crate::shutdown::{ExitReason, ShutdownCoordinator};
use crate::termination::{self, TerminationTiming};
use crate::watchdog::{parent_is_alive, watch_parent};
use exthost_protocol::{
    ActorId, Envelope, EnvelopeReceiver, EnvelopeSender, MessageKind, RpcConfig, RpcProtocol,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handshake and lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    AwaitingReady,
    AwaitingInitData,
    Initialized,
    Terminating,
    Terminated,
}

/// Tunables for the plugin-host lifecycle
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    pub rpc: RpcConfig,
    /// Build marker compared against the host's
    pub commit: Option<String>,
    pub orphan_poll_interval: Duration,
    pub termination: TerminationTiming,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            commit: None,
            orphan_poll_interval: Duration::from_secs(1),
            termination: TerminationTiming::default(),
        }
    }
}

/// A plugin host that completed the handshake
pub struct PluginHost {
    rpc: RpcProtocol,
    init_data: Arc<InitData>,
    shutdown: ShutdownCoordinator,
    state: watch::Receiver<HandshakeState>,
    install: Option<oneshot::Sender<()>>,
    /// `(actor, plugin)` bindings for fault attribution
    actor_plugins: Vec<(ActorId, String)>,
}

impl PluginHost {
    /// Run the handshake over an established channel
    ///
    /// On success the channel is Initialized, inbound envelopes are being
    /// buffered and termination is wired up. Register actors on
    /// [`PluginHost::rpc`] and then call [`PluginHost::start`].
    pub async fn connect(
        sender: EnvelopeSender,
        mut receiver: EnvelopeReceiver,
        options: LifecycleOptions,
        shutdown: ShutdownCoordinator,
    ) -> LifecycleResult<Self> {
        let (state, state_rx) = watch::channel(HandshakeState::AwaitingReady);
        let state = Arc::new(state);

        sender.send(Envelope::of_kind(MessageKind::Ready));
        state.send_replace(HandshakeState::AwaitingInitData);
        debug!("Sent Ready, waiting for init data");

        let init_data = loop {
            let Some(envelope) = receiver.recv().await else {
                warn!("Channel closed before init data arrived");
                state.send_replace(HandshakeState::Terminated);
                shutdown.exit(ExitReason::ChannelClosed);
                return Err(LifecycleError::ChannelClosed);
            };

            if envelope.is_terminate() {
                info!("Terminate received before initialization");
                state.send_replace(HandshakeState::Terminated);
                shutdown.exit(ExitReason::Terminated);
                return Err(LifecycleError::TerminatedDuringHandshake);
            }

            match InitData::from_envelope(&envelope) {
                Ok(init_data) => {
                    if envelope.kind != MessageKind::InitData {
                        warn!(kind = ?envelope.kind, "Init data arrived under an unexpected kind");
                    }
                    break init_data;
                }
                Err(e) => {
                    warn!(
                        kind = ?envelope.kind,
                        request_id = envelope.request_id,
                        error = %e,
                        "Dropping envelope received before initialization"
                    );
                }
            }
        };

        if let (Some(host), Some(ours)) = (&init_data.commit, &options.commit) {
            if host != ours {
                error!(host = %host, plugin_host = %ours, "Build mismatch between host and plugin host");
                state.send_replace(HandshakeState::Terminated);
                shutdown.exit(ExitReason::IncompatibleBuild);
                return Err(LifecycleError::IncompatibleBuild {
                    host: host.clone(),
                    plugin_host: ours.clone(),
                });
            }
        }

        shutdown.set_allow_plugin_exit(init_data.allows_plugin_exit());

        if let Some(parent_pid) = init_data.parent_pid {
            tokio::spawn(watch_parent(
                parent_pid,
                options.orphan_poll_interval,
                shutdown.clone(),
                parent_is_alive,
            ));
        }

        let rpc = RpcProtocol::new(sender.clone(), options.rpc);
        let (install, install_rx) = oneshot::channel();
        tokio::spawn(route(receiver, rpc.clone(), shutdown.clone(), install_rx));
        tokio::spawn(drive_termination(
            rpc.clone(),
            sender.clone(),
            shutdown.clone(),
            Arc::clone(&state),
            options.termination,
        ));

        sender.send(Envelope::of_kind(MessageKind::Initialized));
        state.send_replace(HandshakeState::Initialized);
        info!(
            plugins = init_data.extensions.len(),
            parent_pid = ?init_data.parent_pid,
            "Plugin host initialized"
        );

        Ok(Self {
            rpc,
            init_data: Arc::new(init_data),
            shutdown,
            state: state_rx,
            install: Some(install),
            actor_plugins: Vec::new(),
        })
    }

    pub fn rpc(&self) -> &RpcProtocol {
        &self.rpc
    }

    pub fn init_data(&self) -> &InitData {
        &self.init_data
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn state(&self) -> HandshakeState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HandshakeState> {
        self.state.clone()
    }

    /// Report faults raised by `actor` as runtime errors of `plugin`
    ///
    /// Takes effect for reporters created afterwards, so bind before `start()`.
    pub fn attribute_actor(&mut self, actor: impl Into<ActorId>, plugin: impl Into<String>) {
        self.actor_plugins.push((actor.into(), plugin.into()));
    }

    /// Reporter attributing errors to the plugins named in the init data
    pub fn error_reporter(&self) -> ErrorReporter {
        let mut index = PluginPathIndex::from_init_data(&self.init_data);
        for (actor, plugin) in &self.actor_plugins {
            index.bind_actor(actor.clone(), plugin.clone());
        }
        ErrorReporter::new(self.rpc.clone(), index, self.shutdown.clone())
    }

    /// Begin dispatching to local actors
    ///
    /// Envelopes buffered since the handshake are delivered first, in order.
    pub fn start(&mut self) {
        let Some(install) = self.install.take() else {
            return;
        };
        tokio::spawn(self.error_reporter().forward_faults());
        let _ = install.send(());
        debug!("RPC core installed");
    }

    /// Resolves once the process should exit
    pub async fn wait_for_exit(&self) -> ExitReason {
        self.shutdown.wait_for_exit().await
    }
}

/// Read the channel, intercepting Terminate ahead of RPC dispatch
async fn route(
    mut receiver: EnvelopeReceiver,
    rpc: RpcProtocol,
    shutdown: ShutdownCoordinator,
    mut install: oneshot::Receiver<()>,
) {
    let mut buffered: Vec<Envelope> = Vec::new();
    let mut installed = false;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.termination_requested() => break,
            _ = &mut install, if !installed => {
                installed = true;
                if !buffered.is_empty() {
                    debug!(count = buffered.len(), "Delivering buffered envelopes");
                }
                for envelope in buffered.drain(..) {
                    rpc.receive(envelope);
                }
            }
            message = receiver.recv() => match message {
                Some(envelope) if envelope.is_terminate() => {
                    info!("Received Terminate");
                    shutdown.terminate(ExitReason::Terminated);
                    break;
                }
                Some(envelope) if installed => rpc.receive(envelope),
                Some(envelope) => buffered.push(envelope),
                None => {
                    info!("Channel to host closed");
                    rpc.on_channel_closed();
                    shutdown.terminate(ExitReason::ChannelClosed);
                    break;
                }
            },
        }
    }
    debug!("Envelope router stopped");
}

async fn drive_termination(
    rpc: RpcProtocol,
    sender: EnvelopeSender,
    shutdown: ShutdownCoordinator,
    state: Arc<watch::Sender<HandshakeState>>,
    timing: TerminationTiming,
) {
    shutdown.termination_requested().await;
    if shutdown.exit_reason().is_some() {
        // Immediate exit, nothing to tear down
        state.send_replace(HandshakeState::Terminated);
        return;
    }

    let reason = shutdown
        .termination_reason()
        .unwrap_or(ExitReason::Terminated);
    state.send_replace(HandshakeState::Terminating);
    info!(?reason, "Terminating plugin host");

    // Nothing more goes out once termination starts
    rpc.dispose();
    sender.close();

    termination::deactivate_all(rpc.registry(), timing).await;

    state.send_replace(HandshakeState::Terminated);
    shutdown.exit(reason);
}
