//! Error types for turnstile.

use std::time::Duration;

use thiserror::Error;

/// Main error type for turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration key is present but holds a value of the wrong type
    #[error("Configuration key `{key}` must be {expected}, found {found}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    /// No factory is registered under the requested name
    #[error("No such limiter: {0}")]
    UnknownLimiter(String),

    /// A factory is already registered under this name
    #[error("Limiter already registered: {0}")]
    DuplicateRegistration(String),

    /// The state store could not complete a read or write
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Faults reported by a state store.
///
/// Absence of a key is never a fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing medium cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store did not answer within its bound
    #[error("store timed out after {0:?}")]
    Timeout(Duration),
}

/// Result type alias for turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
