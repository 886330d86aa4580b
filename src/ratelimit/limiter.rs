//! Core rate limiter implementation.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::rules::RateLimitConfig;
use super::store::{KeyState, KeyStateStore};
use crate::error::Result;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The key exhausted its quota and the cooldown penalty is still running.
    CooldownActive,
    /// The key exhausted its quota and must wait for the window to roll over.
    WindowExhausted,
}

impl RejectReason {
    /// Stable identifier for logs and wire output.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::CooldownActive => "cooldown-active",
            RejectReason::WindowExhausted => "window-exhausted",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request that was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admitted {
    /// Admissions left for the key in the current window
    pub remaining: u64,
}

/// A request that was turned away. Waiting `retry_after` makes it admissible.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("rate limited ({reason}), retry after {retry_after:?}")]
pub struct Rejected {
    /// Why the request was rejected
    pub reason: RejectReason,
    /// How long the caller should wait before trying again
    pub retry_after: Duration,
}

/// Per-key admission control for one protected operation.
///
/// This struct is thread-safe and can be shared across threads and tasks.
/// Checks on the same key are serialized; checks on different keys only
/// contend when the keys share a store shard.
pub struct RateLimiter {
    /// The limits this instance enforces
    config: RateLimitConfig,
    /// Per-key counting state
    store: KeyStateStore,
    /// Time source for window and cooldown arithmetic
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a new rate limiter driven by the system clock.
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a new rate limiter driven by the given clock.
    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store: KeyStateStore::new(),
            clock,
        })
    }

    /// The limits this instance enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether a request for `key` may proceed, counting it if so.
    ///
    /// A rejected call leaves the key's state untouched.
    pub fn check_limit(&self, key: &str) -> std::result::Result<Admitted, Rejected> {
        let now = self.clock.now();
        let config = &self.config;

        trace!(key = %key, "Checking rate limit");

        let decision = self
            .store
            .with_state(key, now, |state| Self::apply(config, state, now));

        if let Err(ref rejected) = decision {
            debug!(
                key = %key,
                reason = %rejected.reason,
                retry_after_ms = rejected.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
        }

        decision
    }

    /// The admission algorithm, run inside the key's critical section.
    fn apply(
        config: &RateLimitConfig,
        state: &mut KeyState,
        now: Instant,
    ) -> std::result::Result<Admitted, Rejected> {
        // A caller that read the clock before a racing caller took the lock
        // must not move the key's clocks backwards.
        let now = now.max(state.window_start).max(state.last_reset);

        if state.window_age(now) >= config.time_window {
            state.roll_over(now);
        }

        if let Some(cooldown) = config.cooldown {
            if state.count >= config.max_requests {
                let cooldown_end = state.last_reset + cooldown;
                if now < cooldown_end {
                    return Err(Rejected {
                        reason: RejectReason::CooldownActive,
                        retry_after: cooldown_end - now,
                    });
                }
                // The window keeps its original start; only the counter and
                // the cooldown clock restart here.
                state.count = 0;
                state.last_reset = now;
            }
        }

        if state.count >= config.max_requests {
            let window_end = state.window_start + config.time_window;
            return Err(Rejected {
                reason: RejectReason::WindowExhausted,
                retry_after: window_end.saturating_duration_since(now),
            });
        }

        state.count += 1;
        Ok(Admitted {
            remaining: config.max_requests - state.count,
        })
    }

    /// Admissions `key` has left in its current window.
    ///
    /// Unknown keys and keys whose window has lapsed report the full quota.
    pub fn remaining_quota(&self, key: &str) -> u64 {
        let now = self.clock.now();
        match self.store.get(key) {
            Some(state) if state.window_age(now) < self.config.time_window => {
                self.config.max_requests.saturating_sub(state.count)
            }
            _ => self.config.max_requests,
        }
    }

    /// Time until `key`'s counting window rolls over.
    ///
    /// Returns zero for unknown keys. This never reports cooldown time; the
    /// `retry_after` of a rejected check is the source for that.
    pub fn time_to_reset(&self, key: &str) -> Duration {
        let now = self.clock.now();
        match self.store.get(key) {
            Some(state) => (state.window_start + self.config.time_window)
                .saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }

    /// Drop state for keys whose window and cooldown have both lapsed.
    ///
    /// Evicted keys behave exactly as before, since their next check would
    /// roll the window over anyway. Returns the number of keys removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let retention = self.config.retention();
        let removed = self
            .store
            .evict(|state| state.window_age(now) >= retention);
        if removed > 0 {
            debug!(
                removed = removed,
                remaining = self.store.len(),
                "Evicted expired rate limit state"
            );
        }
        removed
    }

    /// Number of keys with recorded state.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    /// Clear all state.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.store.clear();
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("tracked_keys", &self.store.len())
            .finish()
    }
}
