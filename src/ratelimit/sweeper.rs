//! Background eviction of expired key state.
//!
//! Limiters never forget a key on their own, so a long-running process that
//! sees many distinct keys grows without bound. The sweeper periodically asks
//! the registry to drop state that can no longer influence a decision.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::registry::LimiterRegistry;

/// Handle to a running sweep task.
pub struct Sweeper {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Sweeper {
    /// Start sweeping `registry` every `interval`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(registry: Arc<LimiterRegistry>, interval: Duration) -> Self {
        let (stop, mut stopped) = oneshot::channel();

        info!(interval = ?interval, "Starting rate limit state sweeper");

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.sweep_expired();
                        debug!(removed = removed, "Sweep complete");
                    }
                    _ = &mut stopped => break,
                }
            }
        });

        Self { stop, task }
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "Sweeper task ended abnormally");
        }
        info!("Rate limit state sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::rules::RateLimitConfig;

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_expired_state() {
        let clock = Arc::new(ManualClock::new());
        let registry = Arc::new(
            LimiterRegistry::with_clock(
                vec![(
                    "api".to_string(),
                    RateLimitConfig::new(5)
                        .with_time_window(Duration::from_secs(10))
                        .with_cooldown(Duration::from_secs(1)),
                )],
                clock.clone(),
            )
            .unwrap(),
        );
        let limiter_count = || registry.get("api").unwrap().tracked_keys();

        registry.get("api").unwrap().check_limit("alice").unwrap();
        assert_eq!(limiter_count(), 1);

        let sweeper = Sweeper::spawn(registry.clone(), Duration::from_secs(1));

        // Nothing has expired yet.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(limiter_count(), 1);

        clock.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(limiter_count(), 0);

        sweeper.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweeper_shutdown() {
        let registry = Arc::new(LimiterRegistry::builtin().unwrap());
        let sweeper = Sweeper::spawn(registry, Duration::from_secs(3600));
        sweeper.shutdown().await;
    }
}
