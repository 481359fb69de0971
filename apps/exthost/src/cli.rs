//! Command line entry point for the plugin host process

use crate::log_service::{LogService, LOG_SERVICE_ACTOR};
use anyhow::Context;
use clap::Parser;
use exthost_config::{logging, ExtHostConfig, LogHandle, LogLevel};
use exthost_lifecycle::{
    request_parent_death_signal, ExitReason, LifecycleOptions, PluginHost, ShutdownCoordinator,
    TerminationTiming, ThreadWatchdog,
};
use exthost_protocol::{ActorId, EnvelopeChannel, MonitorConfig, RpcConfig, RpcProtocol, Side};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Plugin host speaking the envelope protocol on stdin/stdout
#[derive(Parser, Debug)]
#[command(name = "exthost")]
#[command(about = "Plugin host process for the envelope RPC protocol")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to exthost.toml or .exthost/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error, critical, off)
    #[arg(long)]
    pub log_level: Option<LogLevel>,
}

/// Parse arguments, run the plugin host and return the process exit code
pub async fn run() -> i32 {
    let cli = Cli::parse();
    match run_with(cli).await {
        Ok(reason) => {
            info!(?reason, code = reason.exit_code(), "Plugin host exiting");
            reason.exit_code()
        }
        Err(e) => {
            // Logging may not be up yet
            eprintln!("exthost: {:#}", e);
            error!(error = %e, "Plugin host failed");
            1
        }
    }
}

async fn run_with(cli: Cli) -> anyhow::Result<ExitReason> {
    let mut config =
        ExtHostConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(level) = cli.log_level {
        config.logging.level = level.as_directive().to_string();
    }
    let log = logging::initialize(&config.logging).context("Failed to initialize logging")?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting plugin host");

    if request_parent_death_signal() {
        debug!("Parent death signal registered");
    }

    let shutdown = ShutdownCoordinator::new();
    spawn_signal_handler(shutdown.clone());

    let (sender, receiver) = EnvelopeChannel::stdio(Side::PluginHost);
    let options = lifecycle_options(&config);
    let termination = options.termination;

    let connect = PluginHost::connect(sender, receiver, options, shutdown.clone());
    let mut plugin_host = tokio::select! {
        result = connect => match result {
            Ok(plugin_host) => plugin_host,
            Err(e) => {
                warn!(error = %e, "Handshake did not complete");
                return Ok(shutdown.exit_reason().unwrap_or(ExitReason::ChannelClosed));
            }
        },
        _ = shutdown.termination_requested() => {
            info!("Terminated before the handshake completed");
            return Ok(shutdown
                .termination_reason()
                .or_else(|| shutdown.exit_reason())
                .unwrap_or(ExitReason::Terminated));
        }
    };

    apply_host_log_level(&log, plugin_host.init_data().log_level);
    register_actors(plugin_host.rpc(), log)?;

    let _watchdog = if config.lifecycle.native_watchdog {
        let exit_hook: exthost_lifecycle::ExitHook = Arc::new(|code| std::process::exit(code));
        match ThreadWatchdog::spawn(
            plugin_host.init_data().parent_pid,
            config.lifecycle.orphan_poll_interval(),
            termination.hard_cap,
            shutdown.clone(),
            exit_hook,
        ) {
            Ok(watchdog) => Some(watchdog),
            Err(e) => {
                warn!(error = %e, "Failed to start watchdog thread");
                None
            }
        }
    } else {
        None
    };

    plugin_host.start();
    Ok(plugin_host.wait_for_exit().await)
}

/// Register the plugin host's own actors and check they are reachable
fn register_actors(rpc: &RpcProtocol, log: LogHandle) -> anyhow::Result<()> {
    rpc.register_local(LOG_SERVICE_ACTOR, Arc::new(LogService::new(log)))
        .context("Failed to register log service")?;
    rpc.registry()
        .assert_registered(&[ActorId::from(LOG_SERVICE_ACTOR)])
        .context("Built-in actors missing before start")?;
    Ok(())
}

fn lifecycle_options(config: &ExtHostConfig) -> LifecycleOptions {
    LifecycleOptions {
        rpc: RpcConfig {
            first_request_id: config.protocol.first_request_id,
            monitor: MonitorConfig {
                unresponsive_threshold: config.protocol.unresponsive_threshold(),
                recheck_interval: config.protocol.recheck_interval(),
            },
        },
        commit: config.build.commit.clone(),
        orphan_poll_interval: config.lifecycle.orphan_poll_interval(),
        termination: TerminationTiming {
            grace: config.lifecycle.shutdown_grace(),
            hard_cap: config.lifecycle.shutdown_timeout(),
        },
    }
}

/// Follow the host's log level unless `RUST_LOG` was given explicitly
fn apply_host_log_level(log: &LogHandle, level: Option<u8>) {
    let Some(code) = level else {
        return;
    };
    if std::env::var_os("RUST_LOG").is_some() {
        debug!(code, "RUST_LOG is set, ignoring host log level");
        return;
    }
    match LogLevel::try_from(code) {
        Ok(level) => {
            if let Err(e) = log.set_level(level) {
                warn!(error = %e, "Failed to apply host log level");
            }
        }
        Err(e) => warn!(error = %e, "Ignoring host log level"),
    }
}

#[cfg(unix)]
fn spawn_signal_handler(shutdown: ShutdownCoordinator) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };
        if sigterm.recv().await.is_some() {
            info!("Received SIGTERM");
            shutdown.terminate(ExitReason::Terminated);
        }
    });
}

#[cfg(not(unix))]
fn spawn_signal_handler(shutdown: ShutdownCoordinator) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            shutdown.terminate(ExitReason::Terminated);
        }
    });
}
