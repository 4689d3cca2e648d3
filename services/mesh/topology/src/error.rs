//! Error types for topology snapshots.

use thiserror::Error;

/// Errors raised while loading or saving topology data
#[derive(Error, Debug)]
pub enum TopologyError {
    /// Snapshot file could not be read or written
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot is not valid JSON for the expected shape
    #[error("snapshot JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Link key is not `MAC|MAC`
    #[error("malformed link key '{0}'")]
    LinkKey(String),
}
