//! Orphan detection and the last-resort exit watchdog

use crate::shutdown::{ExitReason, ShutdownCoordinator};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Called by the thread watchdog to end the process
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Probe whether `pid` still exists using a signal-0 kill
#[cfg(unix)]
pub fn parent_is_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn parent_is_alive(_pid: i32) -> bool {
    true
}

/// Ask the kernel to deliver SIGTERM when the parent dies
///
/// Only available on Linux. Elsewhere polling is the only detection.
#[cfg(target_os = "linux")]
pub fn request_parent_death_signal() -> bool {
    use nix::sys::prctl::set_pdeathsig;
    use nix::sys::signal::Signal;

    match set_pdeathsig(Some(Signal::SIGTERM)) {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Failed to register parent death signal");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn request_parent_death_signal() -> bool {
    false
}

/// Poll the parent until it disappears or termination starts
pub async fn watch_parent(
    parent_pid: i32,
    interval: Duration,
    shutdown: ShutdownCoordinator,
    probe: impl Fn(i32) -> bool + Send + 'static,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !probe(parent_pid) {
                    warn!(parent_pid, "Parent process is gone, terminating");
                    shutdown.terminate(ExitReason::ParentExited);
                    return;
                }
            }
            _ = shutdown.termination_requested() => {
                debug!("Parent watch stopped");
                return;
            }
        }
    }
}

/// OS-thread watchdog that works even when the async runtime is stuck
///
/// It probes the parent like [`watch_parent`] and, once termination has
/// been requested (by anyone), gives the cooperative shutdown `hard_cap`
/// plus one poll interval before calling the exit hook itself.
pub struct ThreadWatchdog {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ThreadWatchdog {
    pub fn spawn(
        parent_pid: Option<i32>,
        interval: Duration,
        hard_cap: Duration,
        shutdown: ShutdownCoordinator,
        exit_hook: ExitHook,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new().name("exthost-watchdog".to_string()).spawn({
            let stop = Arc::clone(&stop);
            move || run_thread(parent_pid, interval, hard_cap, shutdown, exit_hook, stop)
        })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadWatchdog {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

fn run_thread(
    parent_pid: Option<i32>,
    interval: Duration,
    hard_cap: Duration,
    shutdown: ShutdownCoordinator,
    exit_hook: ExitHook,
    stop: Arc<AtomicBool>,
) {
    let mut terminating_since: Option<Instant> = None;

    while !stop.load(Ordering::SeqCst) {
        thread::sleep(interval);

        if let Some(reason) = shutdown.exit_reason() {
            // Cooperative path finished; the binary exits on its own
            debug!(?reason, "Watchdog thread done");
            return;
        }

        if terminating_since.is_none() {
            let parent_gone = parent_pid.is_some_and(|pid| !parent_is_alive(pid));
            if parent_gone {
                shutdown.terminate(ExitReason::ParentExited);
            }
            if shutdown.is_terminating() {
                terminating_since = Some(Instant::now());
            }
        }

        if let Some(since) = terminating_since {
            if since.elapsed() >= hard_cap + interval {
                let code = shutdown
                    .termination_reason()
                    .map(ExitReason::exit_code)
                    .unwrap_or(0);
                error!(code, "Shutdown did not finish in time, forcing exit");
                exit_hook(code);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI32;

    #[cfg(unix)]
    #[test]
    fn test_own_process_is_alive() {
        assert!(parent_is_alive(std::process::id() as i32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_parent_terminates_when_probe_fails() {
        let shutdown = ShutdownCoordinator::new();
        let alive = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(watch_parent(1, Duration::from_secs(1), shutdown.clone(), {
            let alive = Arc::clone(&alive);
            move |_| alive.load(Ordering::SeqCst)
        }));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!shutdown.is_terminating());

        alive.store(false, Ordering::SeqCst);
        task.await.unwrap();
        assert_eq!(shutdown.termination_reason(), Some(ExitReason::ParentExited));
    }

    #[test]
    fn test_thread_watchdog_forces_exit_after_cap() {
        let shutdown = ShutdownCoordinator::new();
        let exited = Arc::new(AtomicI32::new(-1));
        let watchdog = ThreadWatchdog::spawn(
            None,
            Duration::from_millis(10),
            Duration::from_millis(50),
            shutdown.clone(),
            Arc::new({
                let exited = Arc::clone(&exited);
                move |code| exited.store(code, Ordering::SeqCst)
            }),
        )
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(exited.load(Ordering::SeqCst), -1);

        shutdown.terminate(ExitReason::Terminated);
        watchdog.stop_after(Duration::from_secs(2));
        assert_eq!(exited.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_thread_watchdog_stands_down_after_exit() {
        let shutdown = ShutdownCoordinator::new();
        let exited = Arc::new(AtomicI32::new(-1));
        let watchdog = ThreadWatchdog::spawn(
            None,
            Duration::from_millis(10),
            Duration::from_millis(50),
            shutdown.clone(),
            Arc::new({
                let exited = Arc::clone(&exited);
                move |code| exited.store(code, Ordering::SeqCst)
            }),
        )
        .unwrap();

        shutdown.terminate(ExitReason::Terminated);
        shutdown.exit(ExitReason::Terminated);
        watchdog.stop_after(Duration::from_secs(2));
        assert_eq!(exited.load(Ordering::SeqCst), -1);
    }

    impl ThreadWatchdog {
        /// Join the thread, giving it at most `limit` to finish on its own
        fn stop_after(mut self, limit: Duration) {
            let deadline = Instant::now() + limit;
            if let Some(handle) = self.handle.take() {
                while !handle.is_finished() && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(5));
                }
                self.stop.store(true, Ordering::SeqCst);
                handle.join().unwrap();
            }
        }
    }
}
