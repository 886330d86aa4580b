//! Per-key counting state and the sharded store that holds it.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Counting state for a single key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyState {
    /// When the current counting window started
    pub window_start: Instant,
    /// Admissions granted since `window_start` (or since the last cooldown reset)
    pub count: u64,
    /// When the counter was last reset by a rollover or an expired cooldown
    pub last_reset: Instant,
}

impl KeyState {
    /// State for a key whose window starts at `now`.
    pub fn fresh(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
            last_reset: now,
        }
    }

    /// Time elapsed since the window started, saturating at zero.
    pub fn window_age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.window_start)
    }

    /// Restart both the window and the cooldown clock at `now`.
    pub fn roll_over(&mut self, now: Instant) {
        self.count = 0;
        self.window_start = now;
        self.last_reset = now;
    }
}

/// A store of key states, sharded so that different keys rarely contend.
///
/// Mutation happens inside [`KeyStateStore::with_state`], which holds the
/// shard's write lock for the duration of the closure. That closure is the
/// critical section for a key's read-modify-write.
#[derive(Debug, Default)]
pub struct KeyStateStore {
    states: DashMap<String, KeyState>,
}

impl KeyStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the state for `key`, creating fresh state at `now` if absent.
    ///
    /// No other caller can observe or mutate the same key while `f` runs.
    pub fn with_state<R>(
        &self,
        key: &str,
        now: Instant,
        f: impl FnOnce(&mut KeyState) -> R,
    ) -> R {
        if let Some(mut state) = self.states.get_mut(key) {
            return f(&mut *state);
        }

        let mut state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| KeyState::fresh(now));
        f(&mut *state)
    }

    /// A snapshot of the state for `key`, if any.
    pub fn get(&self, key: &str) -> Option<KeyState> {
        self.states.get(key).map(|state| *state)
    }

    /// Remove every state for which `expired` returns true.
    ///
    /// Returns the number of states removed.
    pub fn evict(&self, mut expired: impl FnMut(&KeyState) -> bool) -> usize {
        let mut removed = 0;
        self.states.retain(|_, state| {
            if expired(state) {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Number of keys currently tracked.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.states.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_state_creates_fresh_state() {
        let store = KeyStateStore::new();
        let now = Instant::now();

        let count = store.with_state("alice", now, |state| {
            assert_eq!(*state, KeyState::fresh(now));
            state.count += 1;
            state.count
        });

        assert_eq!(count, 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("alice").map(|s| s.count), Some(1));
    }

    #[test]
    fn test_with_state_reuses_existing_state() {
        let store = KeyStateStore::new();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);

        store.with_state("alice", t0, |state| state.count += 1);
        store.with_state("alice", t1, |state| {
            assert_eq!(state.window_start, t0);
            state.count += 1;
        });

        assert_eq!(store.get("alice").map(|s| s.count), Some(2));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_unknown_key() {
        let store = KeyStateStore::new();
        assert!(store.get("nobody").is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_roll_over_resets_both_clocks() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(90);
        let mut state = KeyState {
            window_start: t0,
            count: 9,
            last_reset: t0,
        };

        state.roll_over(t1);

        assert_eq!(state, KeyState::fresh(t1));
        assert_eq!(state.window_age(t0), Duration::ZERO);
    }

    #[test]
    fn test_evict() {
        let store = KeyStateStore::new();
        let now = Instant::now();
        store.with_state("keep", now, |state| state.count = 1);
        store.with_state("drop", now, |state| state.count = 5);

        let removed = store.evict(|state| state.count > 3);

        assert_eq!(removed, 1);
        assert!(store.get("keep").is_some());
        assert!(store.get("drop").is_none());

        store.clear();
        assert!(store.is_empty());
    }
}
