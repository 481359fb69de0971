//! Shutdown coordination
//!
//! Components never exit the process themselves. They ask the
//! [`ShutdownCoordinator`] either to start an orderly termination or to exit
//! right away, and the binary performs the actual exit once
//! [`ShutdownCoordinator::wait_for_exit`] resolves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code used when host and plugin host were built from different commits
pub const INCOMPATIBLE_BUILD_EXIT_CODE: i32 = 55;

/// Why the plugin host is going away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The host sent Terminate
    Terminated,
    /// The parent process is gone
    ParentExited,
    /// The channel to the host closed
    ChannelClosed,
    /// Commit mismatch during the handshake
    IncompatibleBuild,
    /// A plugin asked to exit and was allowed to
    PluginRequested(i32),
}

impl ExitReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::IncompatibleBuild => INCOMPATIBLE_BUILD_EXIT_CODE,
            ExitReason::PluginRequested(code) => code,
            ExitReason::Terminated | ExitReason::ParentExited | ExitReason::ChannelClosed => 0,
        }
    }
}

struct Inner {
    termination: CancellationToken,
    termination_reason: Mutex<Option<ExitReason>>,
    exit: watch::Sender<Option<ExitReason>>,
    allow_plugin_exit: AtomicBool,
}

/// Single place where termination and exit are requested
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                termination: CancellationToken::new(),
                termination_reason: Mutex::new(None),
                exit,
                allow_plugin_exit: AtomicBool::new(false),
            }),
        }
    }

    /// Begin an orderly termination; the first reason wins
    pub fn terminate(&self, reason: ExitReason) {
        {
            let mut current = self
                .inner
                .termination_reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if current.is_some() {
                return;
            }
            *current = Some(reason);
        }
        info!(?reason, "Termination requested");
        self.inner.termination.cancel();
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.termination.is_cancelled()
    }

    /// Resolves once termination has been requested
    pub async fn termination_requested(&self) {
        self.inner.termination.cancelled().await
    }

    pub fn termination_reason(&self) -> Option<ExitReason> {
        *self
            .inner
            .termination_reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exit without any teardown; the first reason wins
    pub fn exit(&self, reason: ExitReason) {
        let changed = self.inner.exit.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        if changed {
            info!(?reason, code = reason.exit_code(), "Exit requested");
            self.inner.termination.cancel();
        }
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        *self.inner.exit.borrow()
    }

    /// Resolves with the reason once an exit has been requested
    pub async fn wait_for_exit(&self) -> ExitReason {
        let mut rx = self.inner.exit.subscribe();
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `inner`, which `self` keeps alive
                return ExitReason::Terminated;
            }
        }
    }

    pub fn set_allow_plugin_exit(&self, allow: bool) {
        self.inner.allow_plugin_exit.store(allow, Ordering::SeqCst);
    }

    /// Plugin code asking to end the process
    ///
    /// Refused unless plugin exits were allowed, e.g. under a test runner.
    pub fn request_plugin_exit(&self, code: i32) -> bool {
        if self.inner.allow_plugin_exit.load(Ordering::SeqCst) {
            self.exit(ExitReason::PluginRequested(code));
            true
        } else {
            warn!(code, "A plugin tried to exit the plugin host; ignoring");
            false
        }
    }
}
