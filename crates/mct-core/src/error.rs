//! Error types for multi-component transform operations

use thiserror::Error;

/// Result type for multi-component transform operations
pub type MctResult<T> = Result<T, MctError>;

/// Errors that can occur while building or running a transform network
///
/// All of these are fatal: they indicate a malformed tile description or a
/// programming error in the caller, never a transient condition.
#[derive(Error, Debug)]
pub enum MctError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Transform network cannot be inverted: {0}")]
    InversionFailure(String),

    #[error("Reversibility conflict: {0}")]
    ReversibilityConflict(String),

    #[error("Missing thread context: {0}")]
    MissingThreadContext(String),

    #[error("Invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: i32, height: i32 },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
}
