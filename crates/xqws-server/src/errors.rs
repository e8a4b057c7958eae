//! Registry and delivery errors.

use xqws_core::ConnectionId;

use crate::query::SerializeError;

/// Why a value could not be written to a connection.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// The connection was closed; further sends are dropped.
    #[error("connection closed")]
    Closed,

    /// The outbound queue is full.
    #[error("outbound queue full")]
    QueueFull,

    /// The value could not be serialized.
    #[error(transparent)]
    Serialize(#[from] SerializeError),
}

/// Errors from registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A connection with this id is already registered.
    #[error("connection id already registered: {0}")]
    DuplicateId(ConnectionId),

    /// No connection with this id is registered.
    #[error("connection not found: {0}")]
    NotFound(ConnectionId),

    /// The connection was found but the write failed.
    #[error("send failed: {0}")]
    Send(#[from] SendError),
}

/// Result type for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;
