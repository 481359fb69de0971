//! Bounded actor teardown

use exthost_protocol::ActorRegistry;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Grace period and hard cap, both measured from the start of termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationTiming {
    pub grace: Duration,
    pub hard_cap: Duration,
}

impl Default for TerminationTiming {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(1),
            hard_cap: Duration::from_secs(4),
        }
    }
}

/// Deactivate every local actor, returning no earlier than `grace` and no
/// later than `hard_cap`
///
/// Returns whether all deactivation hooks completed.
pub async fn deactivate_all(registry: &ActorRegistry, timing: TerminationTiming) -> bool {
    let started = Instant::now();
    let finished = tokio::time::timeout(timing.hard_cap, registry.deactivate_all())
        .await
        .is_ok();

    if finished {
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "All actors deactivated");
        tokio::time::sleep_until(started + timing.grace).await;
    } else {
        warn!(
            hard_cap_ms = timing.hard_cap.as_millis() as u64,
            "Actor deactivation did not finish in time"
        );
    }
    finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use exthost_protocol::{async_trait, Actor, CancellationToken, Reply, RpcError, RpcResult};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct SlowTeardown {
        delay: Duration,
        started: AtomicBool,
    }

    #[async_trait]
    impl Actor for SlowTeardown {
        async fn invoke(
            &self,
            method: &str,
            _args: Vec<Value>,
            _cancellation: CancellationToken,
        ) -> RpcResult<Reply> {
            Err(RpcError::unknown_method(method))
        }

        async fn deactivate(&self) {
            self.started.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
        }
    }

    fn assert_elapsed_near(started: Instant, expected: Duration) {
        let elapsed = started.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {:?}, expected about {:?}",
            elapsed,
            expected
        );
    }

    fn registry_with(delay: Duration) -> (ActorRegistry, Arc<SlowTeardown>) {
        let actor = Arc::new(SlowTeardown {
            delay,
            started: AtomicBool::new(false),
        });
        let registry = ActorRegistry::new();
        registry.register_local(1, actor.clone()).unwrap();
        (registry, actor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_teardown_waits_for_grace() {
        let (registry, actor) = registry_with(Duration::from_millis(100));
        let started = Instant::now();

        assert!(deactivate_all(&registry, TerminationTiming::default()).await);
        assert!(actor.started.load(Ordering::SeqCst));
        assert_elapsed_near(started, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_teardown_is_cut_at_cap() {
        let (registry, actor) = registry_with(Duration::from_secs(10));
        let started = Instant::now();

        assert!(!deactivate_all(&registry, TerminationTiming::default()).await);
        assert!(actor.started.load(Ordering::SeqCst));
        assert_elapsed_near(started, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_between_grace_and_cap() {
        let (registry, _actor) = registry_with(Duration::from_millis(2500));
        let started = Instant::now();

        assert!(deactivate_all(&registry, TerminationTiming::default()).await);
        assert_elapsed_near(started, Duration::from_millis(2500));
    }
}
