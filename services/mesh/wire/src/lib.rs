//! Wire protocol for Ilumi BLE bulbs.
//!
//! This crate provides the packet layer spoken over the bulbs' single GATT
//! characteristic: command envelopes with sequence state, payload encoding,
//! notification decoding, fragmentation and mesh proxy framing. It performs
//! no I/O.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 network_key (LE) | shared network secret      |
//! +----------------------+----------------------------+
//! | u8 seq_num           | always even                |
//! +----------------------+----------------------------+
//! | u8 command           | see CommandId              |
//! +----------------------+----------------------------+
//! | payload              | command specific           |
//! +----------------------+----------------------------+
//! ```
//!
//! Payloads longer than 20 bytes are split into DATA_CHUNK fragments, see
//! [`chunk`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod codec;
pub mod error;
pub mod header;
pub mod mac;
pub mod proxy;
pub mod response;
pub mod topology;

// Re-export main types
pub use chunk::{Chunker, Fragment, Reassembler, CHUNK_DATA_SIZE, MAX_DIRECT_PAYLOAD};
pub use codec::{
    encode_color, encode_color_smooth, encode_commission, encode_enter_bootloader, encode_scene,
    encode_start_pattern, encode_turn, ColorFrame, Command, Scene, SceneFrame, REPEAT_FOREVER,
};
pub use error::WireError;
pub use header::{CommandId, ConfigCommand, Envelope, NetworkState, ENVELOPE_SIZE};
pub use mac::MacAddr;
pub use proxy::{ttl_for, ProxyEnvelope, PROXY_HEADER_SIZE, TTL_LONG, TTL_SHORT};
pub use response::{
    decode_bulb_color, decode_device_info, decode_mesh_neighbor_block, ColorReading, DeviceInfo,
    Response, ResponseHeader, ResponseKind,
};
pub use topology::MeshNeighbor;
