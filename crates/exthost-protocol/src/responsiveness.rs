//! Peer responsiveness tracking based on acknowledgement latency
//!
//! One deadline and at most one recheck timer are kept regardless of how
//! many requests are outstanding. Every Acknowledge pushes the deadline out
//! again, so a burst of requests answered steadily never trips the monitor.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default time without any acknowledgement before the peer is unresponsive
pub const DEFAULT_UNRESPONSIVE_THRESHOLD: Duration = Duration::from_secs(3);
/// Default interval between checks
pub const DEFAULT_RECHECK_INTERVAL: Duration = Duration::from_secs(1);

const EVENT_CAPACITY: usize = 16;

/// Classification of the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsiveState {
    Responsive,
    Unresponsive,
}

/// Timing knobs for the monitor
#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub unresponsive_threshold: Duration,
    pub recheck_interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            unresponsive_threshold: DEFAULT_UNRESPONSIVE_THRESHOLD,
            recheck_interval: DEFAULT_RECHECK_INTERVAL,
        }
    }
}

struct MonitorState {
    unacknowledged: usize,
    deadline: Instant,
    state: ResponsiveState,
    timer: Option<JoinHandle<()>>,
}

struct MonitorInner {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<ResponsiveState>,
}

impl MonitorInner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: &mut MonitorState, next: ResponsiveState) {
        if state.state == next {
            return;
        }
        state.state = next;
        match next {
            ResponsiveState::Unresponsive => warn!(
                outstanding = state.unacknowledged,
                "Peer became unresponsive"
            ),
            ResponsiveState::Responsive => debug!("Peer is responsive again"),
        }
        // No subscribers is fine
        let _ = self.events.send(next);
    }
}

/// Tracks unacknowledged outbound requests
#[derive(Clone)]
pub struct ResponsivenessMonitor {
    inner: Arc<MonitorInner>,
}

impl ResponsivenessMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                state: Mutex::new(MonitorState {
                    unacknowledged: 0,
                    deadline: Instant::now(),
                    state: ResponsiveState::Responsive,
                    timer: None,
                }),
                events,
            }),
        }
    }

    pub fn state(&self) -> ResponsiveState {
        self.inner.lock().state
    }

    /// Number of requests sent and not yet acknowledged
    pub fn unacknowledged(&self) -> usize {
        self.inner.lock().unacknowledged
    }

    /// Receive state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<ResponsiveState> {
        self.inner.events.subscribe()
    }

    /// Record that a request is about to be sent
    pub fn on_will_send_request(&self) {
        let mut state = self.inner.lock();
        if state.unacknowledged == 0 {
            state.deadline = Instant::now() + self.inner.config.unresponsive_threshold;
        }
        state.unacknowledged += 1;

        if state.timer.is_none() {
            let inner = Arc::clone(&self.inner);
            let first_check = self.inner.config.recheck_interval;
            state.timer = Some(tokio::spawn(run_checks(inner, first_check)));
        }
    }

    /// Record an Acknowledge from the peer
    pub fn on_acknowledged(&self) {
        let mut state = self.inner.lock();
        state.deadline = Instant::now() + self.inner.config.unresponsive_threshold;
        state.unacknowledged = state.unacknowledged.saturating_sub(1);
        if state.unacknowledged == 0 {
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
        }
        self.inner.set_state(&mut state, ResponsiveState::Responsive);
    }

    /// Stop checking
    pub fn dispose(&self) {
        let mut state = self.inner.lock();
        state.unacknowledged = 0;
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

async fn run_checks(inner: Arc<MonitorInner>, first_check: Duration) {
    let mut wait = first_check;
    loop {
        tokio::time::sleep(wait).await;

        let mut state = inner.lock();
        if state.unacknowledged == 0 {
            state.timer = None;
            return;
        }

        let now = Instant::now();
        if now >= state.deadline {
            inner.set_state(&mut state, ResponsiveState::Unresponsive);
            wait = inner.config.recheck_interval;
        } else {
            wait = state.deadline - now;
        }
    }
}
