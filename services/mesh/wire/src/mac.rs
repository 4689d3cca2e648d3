//! Bluetooth device addresses.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::WireError;

/// MAC address length in bytes
pub const MAC_LEN: usize = 6;

/// A 6-byte BLE device address in display order (most significant byte first).
///
/// The bulbs put addresses on the wire least significant byte first, so
/// [`MacAddr::to_wire`] and [`MacAddr::from_wire`] reverse the byte order.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; MAC_LEN]);

impl MacAddr {
    /// Build from wire (reversed) byte order
    pub fn from_wire(bytes: [u8; MAC_LEN]) -> Self {
        let mut b = bytes;
        b.reverse();
        Self(b)
    }

    /// Bytes in wire (reversed) order
    pub fn to_wire(self) -> [u8; MAC_LEN] {
        let mut b = self.0;
        b.reverse();
        b
    }

    /// Last two octets, used for short default names
    pub fn short_suffix(&self) -> String {
        format!("{:02X}:{:02X}", self.0[4], self.0[5])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(|c: char| c == ':' || c == '-').collect();
        if parts.len() != MAC_LEN {
            return Err(WireError::Mac(s.to_string()));
        }

        let mut bytes = [0u8; MAC_LEN];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(WireError::Mac(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| WireError::Mac(s.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
