//! Turnstile - In-process Admission Control
//!
//! This crate implements per-key admission control: each protected operation
//! gets its own rate limiter that counts requests per caller key inside a
//! time window and applies a cooldown penalty once the quota is exhausted.
//! Limiters are built once at startup and looked up by operation name through
//! a [`ratelimit::LimiterRegistry`].

pub mod config;
pub mod error;
pub mod ratelimit;
