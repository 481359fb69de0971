//! Plugin host lifecycle
//!
//! Startup handshake, orphan detection, error forwarding and bounded
//! termination on top of [`exthost_protocol`].

pub mod error;
pub mod handshake;
pub mod host;
pub mod init_data;
pub mod reporter;
pub mod shutdown;
pub mod termination;
pub mod watchdog;

pub use error::{LifecycleError, LifecycleResult};
pub use handshake::{HandshakeState, LifecycleOptions, PluginHost};
pub use host::HostConnection;
pub use init_data::{Environment, InitData, PluginDescription};
pub use reporter::{ErrorReporter, PluginPathIndex, ReportTarget};
pub use shutdown::{ExitReason, ShutdownCoordinator, INCOMPATIBLE_BUILD_EXIT_CODE};
pub use termination::TerminationTiming;
pub use watchdog::{parent_is_alive, request_parent_death_signal, ExitHook, ThreadWatchdog};
