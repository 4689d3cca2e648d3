//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Packet shorter than the structure being decoded
    #[error("incomplete packet: need {needed} bytes, got {actual}")]
    Incomplete {
        /// Bytes required
        needed: usize,
        /// Bytes available
        actual: usize,
    },

    /// Size limit exceeded or violated
    #[error("size limit violated: {0}")]
    Size(usize),

    /// Unknown command id
    #[error("unknown command {0}")]
    Type(u8),

    /// Notification carries a different command than expected
    #[error("unexpected command {actual}, expected {expected}")]
    UnexpectedCommand {
        /// Command id the decoder expected
        expected: u8,
        /// Command id found in the packet
        actual: u8,
    },

    /// Unparseable MAC address text
    #[error("invalid mac address: {0}")]
    Mac(String),

    /// Malformed packet structure
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

impl WireError {
    pub(crate) fn incomplete(needed: usize, actual: usize) -> Self {
        WireError::Incomplete { needed, actual }
    }
}
