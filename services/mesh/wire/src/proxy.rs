//! Mesh proxy framing.
//!
//! A proxied message is delivered by the connected bulb to exactly one
//! addressed bulb. Layout after the PROXY_MSG envelope:
//!
//! ```text
//! +---------+-----------+-------------------+--------------+-------------+
//! | ttl u8  | count u8  | payload_len u16LE | mac (6, rev) | inner bytes |
//! +---------+-----------+-------------------+--------------+-------------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::mac::{MacAddr, MAC_LEN};
use crate::WireError;

/// TTL for short inner commands
pub const TTL_SHORT: u8 = 47;

/// TTL for long inner commands
pub const TTL_LONG: u8 = 15;

/// Longest inner command that still uses [`TTL_SHORT`]
pub const SHORT_INNER_MAX: usize = 17;

/// Proxy header size (ttl, count, payload length)
pub const PROXY_HEADER_SIZE: usize = 4;

/// Proxy framing for a single target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEnvelope {
    /// Addressed bulb
    pub target: MacAddr,
    /// Fully encoded inner command, envelope included
    pub inner: Bytes,
}

impl ProxyEnvelope {
    /// Wrap an encoded command for `target`
    pub fn new(target: MacAddr, inner: Bytes) -> Self {
        Self { target, inner }
    }

    /// TTL chosen from the inner command length
    pub fn ttl(&self) -> u8 {
        ttl_for(self.inner.len())
    }

    /// Encode the proxy body (without the PROXY_MSG envelope)
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        let payload_len = MAC_LEN + self.inner.len();
        if payload_len > u16::MAX as usize {
            return Err(WireError::Size(payload_len));
        }

        buf.reserve(PROXY_HEADER_SIZE + payload_len);
        buf.put_u8(self.ttl());
        buf.put_u8(1);
        buf.put_u16_le(payload_len as u16);
        buf.put_slice(&self.target.to_wire());
        buf.put_slice(&self.inner);
        Ok(())
    }
}

/// TTL for an inner command of `inner_len` bytes
pub fn ttl_for(inner_len: usize) -> u8 {
    if inner_len <= SHORT_INNER_MAX {
        TTL_SHORT
    } else {
        TTL_LONG
    }
}
