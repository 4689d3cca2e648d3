//! Session error types.

use crate::transport::TransportError;
use mesh_storage::StorageError;
use mesh_wire::WireError;
use thiserror::Error;

/// Errors surfaced by sessions, the manager and the crawler
#[derive(Error, Debug)]
pub enum SessionError {
    /// Could not connect to the bulb
    #[error("connection failed: {0}")]
    Connection(#[source] TransportError),

    /// Link-level failure on an open session
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Packet could not be encoded
    #[error("protocol error: {0}")]
    Protocol(#[from] WireError),

    /// Persisted state could not be read or written
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Session is not in the Ready state
    #[error("session not ready")]
    NotReady,
}

impl SessionError {
    /// Whether the same operation may succeed after a pause
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Connection(e) if e.is_busy())
    }
}
