//! Error types for protocol operations

use thiserror::Error;

/// Protocol-specific errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid or truncated envelope
    #[error("Invalid envelope")]
    InvalidEnvelope,

    /// Envelope exceeds the size ceiling
    #[error("Envelope too large: {size} bytes (max: {max})")]
    EnvelopeTooLarge {
        /// Actual envelope size
        size: usize,
        /// Maximum allowed size
        max: usize,
    },
}
