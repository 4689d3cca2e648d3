//! Mesh routing records reported by the bulbs.

use serde::{Deserialize, Serialize};

use crate::mac::MacAddr;

/// One entry of a bulb's routing table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshNeighbor {
    /// Neighbor address
    pub address: MacAddr,
    /// Hop count to the neighbor
    pub hops: u8,
    /// Received signal strength in dBm
    pub rssi: i8,
}

impl MeshNeighbor {
    /// Whether the reading is usable (zero means "no reading")
    pub fn has_signal(&self) -> bool {
        self.rssi != 0
    }
}
