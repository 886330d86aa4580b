//! Error types for the Turnstile crate.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Rate limit rejections are not errors of this kind; see
/// [`crate::ratelimit::Rejected`].
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lookup of an operation that was never registered
    #[error("Unknown operation: {0}")]
    UnknownOperation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
