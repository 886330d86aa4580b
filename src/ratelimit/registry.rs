//! The fixed table of named rate limiters.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::limiter::RateLimiter;
use super::rules::{builtin_operations, RateLimitConfig};
use crate::error::{Result, TurnstileError};

/// A set of rate limiters, one per protected operation.
///
/// The set is fixed at construction; callers look limiters up by operation
/// name and cannot register new ones afterwards.
#[derive(Debug)]
pub struct LimiterRegistry {
    limiters: HashMap<String, RateLimiter>,
}

impl LimiterRegistry {
    /// Build a registry from an operation table, using the system clock.
    pub fn new<I>(operations: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, RateLimitConfig)>,
    {
        Self::with_clock(operations, Arc::new(SystemClock))
    }

    /// Build a registry whose limiters all share the given clock.
    pub fn with_clock<I>(operations: I, clock: Arc<dyn Clock>) -> Result<Self>
    where
        I: IntoIterator<Item = (String, RateLimitConfig)>,
    {
        let mut limiters = HashMap::new();
        for (name, config) in operations {
            if name.is_empty() {
                return Err(TurnstileError::Config(
                    "operation name must not be empty".to_string(),
                ));
            }
            let limiter = RateLimiter::with_clock(config, clock.clone()).map_err(|e| {
                TurnstileError::Config(format!("operation '{}': {}", name, e))
            })?;
            debug!(
                operation = %name,
                max_requests = config.max_requests,
                time_window = ?config.time_window,
                cooldown = ?config.cooldown,
                "Registered rate limiter"
            );
            limiters.insert(name, limiter);
        }

        info!(operations = limiters.len(), "Limiter registry initialized");
        Ok(Self { limiters })
    }

    /// Build a registry with the built-in operation table.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_operations())
    }

    /// Look up the limiter for an operation.
    pub fn get(&self, operation: &str) -> Result<&RateLimiter> {
        self.limiters
            .get(operation)
            .ok_or_else(|| TurnstileError::UnknownOperation(operation.to_string()))
    }

    /// Names of the registered operations, in no particular order.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.limiters.keys().map(String::as_str)
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Whether the registry has no operations.
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Sweep expired key state from every limiter.
    ///
    /// Returns the total number of keys removed.
    pub fn sweep_expired(&self) -> usize {
        self.limiters
            .values()
            .map(RateLimiter::sweep_expired)
            .sum()
    }
}
