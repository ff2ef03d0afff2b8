//! Error types and result aliases for windlass.
//!
//! This module defines the shared error types used across all windlass
//! components. Errors are structured for programmatic handling and include
//! context for debugging.

/// The result type used throughout windlass-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in windlass-core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the identifier invalid.
        message: String,
    },

    /// Invalid input was provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A task token could not be decoded.
    #[error("invalid task token: {message}")]
    InvalidToken {
        /// Description of what made the token invalid.
        message: String,
    },
}

impl Error {
    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
