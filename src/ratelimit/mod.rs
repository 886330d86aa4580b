//! Rate limiting logic and state management.

mod clock;
mod limiter;
mod registry;
mod rules;
mod store;
mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{Admitted, RateLimiter, RejectReason, Rejected};
pub use registry::LimiterRegistry;
pub use rules::{
    builtin_operations, operation, RateLimitConfig, DEFAULT_COOLDOWN, DEFAULT_MAX_REQUESTS,
    DEFAULT_TIME_WINDOW,
};
pub use store::{KeyState, KeyStateStore};
pub use sweeper::Sweeper;
