//! Rate limit rules: the per-operation limiter configuration.
//!
//! A rule is the `(max_requests, time_window, cooldown)` triple a single
//! [`RateLimiter`](super::RateLimiter) is built from. Rules deserialize from
//! YAML with durations expressed in milliseconds:
//!
//! ```yaml
//! max_requests: 10
//! time_window_ms: 60000
//! cooldown_ms: 5000
//! ```
//!
//! Fields that are absent take their defaults. Fields that are present are
//! taken as written, so `max_requests: 0` is rejected by [`RateLimitConfig::validate`]
//! rather than silently replaced, and `cooldown_ms: null` disables the cooldown.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{Result, TurnstileError};

/// Default number of admissions per window.
pub const DEFAULT_MAX_REQUESTS: u64 = 50;
/// Default window width.
pub const DEFAULT_TIME_WINDOW: Duration = Duration::from_secs(60);
/// Default cooldown penalty.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Names of the built-in protected operations.
pub mod operation {
    /// General API traffic.
    pub const API: &str = "api";
    /// Login and credential checks.
    pub const AUTH: &str = "auth";
    /// Certificate issuance.
    pub const CERTIFICATE: &str = "certificate";
    /// Calls out to the AI service.
    pub const AI: &str = "ai";
}

/// Configuration for a single rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Maximum admissions allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,
    /// Width of the counting window
    #[serde(
        rename = "time_window_ms",
        default = "default_time_window",
        with = "duration_ms"
    )]
    pub time_window: Duration,
    /// Penalty applied once the quota is exhausted; `None` disables it
    #[serde(
        rename = "cooldown_ms",
        default = "default_cooldown",
        with = "option_duration_ms"
    )]
    pub cooldown: Option<Duration>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            time_window: DEFAULT_TIME_WINDOW,
            cooldown: Some(DEFAULT_COOLDOWN),
        }
    }
}

fn default_max_requests() -> u64 {
    DEFAULT_MAX_REQUESTS
}

fn default_time_window() -> Duration {
    DEFAULT_TIME_WINDOW
}

fn default_cooldown() -> Option<Duration> {
    Some(DEFAULT_COOLDOWN)
}

impl RateLimitConfig {
    /// Create a configuration with the given quota and default window and cooldown.
    pub fn new(max_requests: u64) -> Self {
        Self {
            max_requests,
            ..Self::default()
        }
    }

    /// Set the window width.
    pub fn with_time_window(mut self, time_window: Duration) -> Self {
        self.time_window = time_window;
        self
    }

    /// Set the cooldown penalty.
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Disable the cooldown penalty; exhausted keys wait for the window instead.
    pub fn without_cooldown(mut self) -> Self {
        self.cooldown = None;
        self
    }

    /// Check that the quota and window are usable.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(TurnstileError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if self.time_window.is_zero() {
            return Err(TurnstileError::Config(
                "time_window_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// How long a key's state stays meaningful after its window started.
    ///
    /// Past this horizon the next check rolls the window over unconditionally,
    /// so the state is indistinguishable from a key that was never seen.
    pub fn retention(&self) -> Duration {
        self.time_window.max(self.cooldown.unwrap_or(Duration::ZERO))
    }
}

/// The fixed table of operations a default registry protects.
pub fn builtin_operations() -> BTreeMap<String, RateLimitConfig> {
    let mut table = BTreeMap::new();
    table.insert(
        operation::API.to_string(),
        RateLimitConfig::new(100).with_cooldown(Duration::from_secs(5)),
    );
    table.insert(
        operation::AUTH.to_string(),
        RateLimitConfig::new(5)
            .with_time_window(Duration::from_secs(15 * 60))
            .with_cooldown(Duration::from_secs(60)),
    );
    table.insert(
        operation::CERTIFICATE.to_string(),
        RateLimitConfig::new(10)
            .with_time_window(Duration::from_secs(3600))
            .with_cooldown(Duration::from_secs(30)),
    );
    table.insert(
        operation::AI.to_string(),
        RateLimitConfig::new(20).with_cooldown(Duration::from_secs(10)),
    );
    table
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
