//! Error types for the environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The addressed entity's mailbox no longer has a receiver
    #[error("Mailbox closed: {0}")]
    MailboxClosed(String),

    /// Writing to the output sink failed
    #[error("Sink error: {0}")]
    SinkError(String),

    /// Record serialization/deserialization failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Context operation failed
    #[error("Context error: {0}")]
    ContextError(String),

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a mailbox-closed error for the given entity.
    pub fn closed(entity: impl std::fmt::Display) -> Self {
        Self::MailboxClosed(entity.to_string())
    }

    /// Creates a sink error.
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::SinkError(msg.into())
    }

    /// Creates a serialization error.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::SerializationError(msg.to_string())
    }
}
