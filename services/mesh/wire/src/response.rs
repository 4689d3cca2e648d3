//! Notification decoding.
//!
//! Every notification starts with a 4-byte [`ResponseHeader`]. Proxied
//! replies (command 28) carry the inner reply behind the proxy framing.

use bytes::Buf;
use serde::{Deserialize, Serialize};

use crate::header::{CommandId, RESPONSE_HEADER_SIZE};
use crate::mac::{MacAddr, MAC_LEN};
use crate::topology::MeshNeighbor;
use crate::WireError;

/// Size of the device info record
pub const DEVICE_INFO_SIZE: usize = 10;

/// Size of one routing table entry
pub const NEIGHBOR_ENTRY_SIZE: usize = 8;

/// Offset of the inner length inside a proxied reply
const PROXY_INNER_LEN_OFFSET: usize = 8;

/// Offset of the inner record inside a proxied reply
const PROXY_INNER_OFFSET: usize = 10;

/// Model numbers of the Gen2 Nordic platform
const NORDIC_MODELS: [u8; 2] = [65, 81];

/// Common notification header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Raw command id
    pub command: u8,
    /// Status byte
    pub status: u8,
    /// Declared payload size
    pub payload_size: u16,
}

impl ResponseHeader {
    /// Decode from the front of a notification
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < RESPONSE_HEADER_SIZE {
            return Err(WireError::incomplete(RESPONSE_HEADER_SIZE, data.len()));
        }
        let mut buf = data;
        Ok(Self {
            command: buf.get_u8(),
            status: buf.get_u8(),
            payload_size: buf.get_u16_le(),
        })
    }
}

/// Firmware and hardware details
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Application firmware version
    pub firmware_version: u16,
    /// Bootloader version
    pub bootloader_version: u16,
    /// Non-zero once commissioned
    pub commission_status: u8,
    /// Hardware model
    pub model_number: u8,
    /// Cause of the last reset
    pub reset_reason: u16,
    /// BLE stack version
    pub ble_stack_version: u16,
}

impl DeviceInfo {
    /// Gen2 bulbs built on the Nordic platform
    pub fn is_nordic(&self) -> bool {
        NORDIC_MODELS.contains(&self.model_number)
    }
}

/// Color as reported by a bulb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorReading {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
    /// White
    pub w: u8,
    /// Brightness
    pub brightness: u8,
}

impl ColorReading {
    fn from_slice(b: &[u8]) -> Self {
        Self {
            r: b[0],
            g: b[1],
            b: b[2],
            w: b[3],
            brightness: b[4],
        }
    }
}

fn expect_command(data: &[u8], expected: CommandId) -> Result<ResponseHeader, WireError> {
    let header = ResponseHeader::decode(data)?;
    if header.command != expected as u8 {
        return Err(WireError::UnexpectedCommand {
            expected: expected as u8,
            actual: header.command,
        });
    }
    Ok(header)
}

/// Parse a GET_DEVICE_INFO reply
pub fn decode_device_info(data: &[u8]) -> Result<DeviceInfo, WireError> {
    expect_command(data, CommandId::GetDeviceInfo)?;

    let body = &data[RESPONSE_HEADER_SIZE..];
    if body.len() < DEVICE_INFO_SIZE {
        return Err(WireError::incomplete(DEVICE_INFO_SIZE, body.len()));
    }

    let mut buf = body;
    Ok(DeviceInfo {
        firmware_version: buf.get_u16_le(),
        bootloader_version: buf.get_u16_le(),
        commission_status: buf.get_u8(),
        model_number: buf.get_u8(),
        reset_reason: buf.get_u16_le(),
        ble_stack_version: buf.get_u16_le(),
    })
}

/// Parse a color reply, direct or proxy-wrapped
pub fn decode_bulb_color(data: &[u8]) -> Result<ColorReading, WireError> {
    let header = ResponseHeader::decode(data)?;

    if header.command == CommandId::GetBulbColor as u8 {
        let body = &data[RESPONSE_HEADER_SIZE..];
        if body.len() < 5 {
            return Err(WireError::incomplete(RESPONSE_HEADER_SIZE + 5, data.len()));
        }
        return Ok(ColorReading::from_slice(body));
    }

    if header.command == CommandId::ProxyMsg as u8 {
        let inner = proxy_inner(data)?;
        if inner.len() >= 6 && inner[0] == CommandId::GetBulbColor as u8 {
            return Ok(ColorReading::from_slice(&inner[1..6]));
        }
        return Err(WireError::Malformed("proxied reply is not a color record"));
    }

    Err(WireError::UnexpectedCommand {
        expected: CommandId::GetBulbColor as u8,
        actual: header.command,
    })
}

/// Inner record of a proxied reply, bounded by what arrived
fn proxy_inner(data: &[u8]) -> Result<&[u8], WireError> {
    if data.len() < PROXY_INNER_OFFSET {
        return Err(WireError::incomplete(PROXY_INNER_OFFSET, data.len()));
    }
    let mut len_bytes = &data[PROXY_INNER_LEN_OFFSET..PROXY_INNER_OFFSET];
    let inner_len = len_bytes.get_u16_le() as usize;
    let end = (PROXY_INNER_OFFSET + inner_len).min(data.len());
    Ok(&data[PROXY_INNER_OFFSET..end])
}

/// Parse one QUERY_ROUTING notification.
///
/// The declared payload size is trusted only up to the bytes received; a
/// trailing partial entry is dropped.
pub fn decode_mesh_neighbor_block(data: &[u8]) -> Result<Vec<MeshNeighbor>, WireError> {
    let header = expect_command(data, CommandId::QueryRouting)?;

    let available = data.len() - RESPONSE_HEADER_SIZE;
    let size = (header.payload_size as usize).min(available);
    let body = &data[RESPONSE_HEADER_SIZE..RESPONSE_HEADER_SIZE + size];

    let neighbors = body
        .chunks_exact(NEIGHBOR_ENTRY_SIZE)
        .map(|entry| {
            let mut mac = [0u8; MAC_LEN];
            mac.copy_from_slice(&entry[..MAC_LEN]);
            MeshNeighbor {
                address: MacAddr::from_wire(mac),
                hops: entry[6],
                rssi: entry[7] as i8,
            }
        })
        .collect();

    Ok(neighbors)
}

/// Response tag used to route notifications to waiting queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// Color reply
    Color,
    /// Device info reply
    DeviceInfo,
    /// Routing table block
    MeshNeighbors,
}

/// A decoded notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Color reply (direct or proxied)
    Color(ColorReading),
    /// Device info reply
    DeviceInfo(DeviceInfo),
    /// One routing table block
    MeshNeighbors(Vec<MeshNeighbor>),
    /// Anything else, such as command acknowledgements
    Other(ResponseHeader),
}

impl Response {
    /// Classify and decode a notification
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let header = ResponseHeader::decode(data)?;

        match CommandId::try_from(header.command) {
            Ok(CommandId::GetBulbColor) => decode_bulb_color(data).map(Response::Color),
            Ok(CommandId::GetDeviceInfo) => decode_device_info(data).map(Response::DeviceInfo),
            Ok(CommandId::QueryRouting) => {
                decode_mesh_neighbor_block(data).map(Response::MeshNeighbors)
            }
            Ok(CommandId::ProxyMsg) => {
                let inner = proxy_inner(data)?;
                if inner.len() >= 6 && inner[0] == CommandId::GetBulbColor as u8 {
                    decode_bulb_color(data).map(Response::Color)
                } else {
                    Ok(Response::Other(header))
                }
            }
            _ => Ok(Response::Other(header)),
        }
    }

    /// Tag for the pending request table, `None` for untracked replies
    pub fn kind(&self) -> Option<ResponseKind> {
        match self {
            Response::Color(_) => Some(ResponseKind::Color),
            Response::DeviceInfo(_) => Some(ResponseKind::DeviceInfo),
            Response::MeshNeighbors(_) => Some(ResponseKind::MeshNeighbors),
            Response::Other(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_device_info() {
        let mut data = vec![40, 0, 0, 0];
        data.extend_from_slice(&[0x05, 0x01, 0x00, 0x02, 1, 3, 1, 0, 16, 0]);

        let info = decode_device_info(&data).unwrap();
        assert_eq!(info.firmware_version, 0x0105);
        assert_eq!(info.bootloader_version, 0x0200);
        assert_eq!(info.commission_status, 1);
        assert_eq!(info.model_number, 3);
        assert_eq!(info.reset_reason, 1);
        assert_eq!(info.ble_stack_version, 16);
        assert!(!info.is_nordic());
    }

    #[test]
    fn test_decode_device_info_short() {
        let data = [40, 0, 0, 0, 1, 2, 3];
        assert!(matches!(
            decode_device_info(&data),
            Err(WireError::Incomplete { needed: 10, actual: 3 })
        ));
    }

    #[test]
    fn test_decode_bulb_color_direct() {
        let data = [16, 0, 0, 0, 255, 128, 64, 0, 200];
        let color = decode_bulb_color(&data).unwrap();
        assert_eq!(
            color,
            ColorReading {
                r: 255,
                g: 128,
                b: 64,
                w: 0,
                brightness: 200
            }
        );
    }

    #[test]
    fn test_decode_bulb_color_proxied() {
        let data = [28, 0, 0, 0, 0, 0, 0, 0, 6, 0, 16, 1, 2, 3, 4, 5];
        let color = decode_bulb_color(&data).unwrap();
        assert_eq!(color.r, 1);
        assert_eq!(color.brightness, 5);

        assert_eq!(Response::decode(&data).unwrap().kind(), Some(ResponseKind::Color));
    }

    #[test]
    fn test_decode_mesh_neighbors() {
        let mut data = vec![31, 0, 17, 0];
        data.extend_from_slice(&[0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 1, 0xC4]);
        data.extend_from_slice(&[0x06, 0x05, 0x04, 0x03, 0x02, 0x01, 2, 0xB0]);
        // trailing partial entry
        data.push(0xAA);

        let neighbors = decode_mesh_neighbor_block(&data).unwrap();
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].address.to_string(), "11:22:33:44:55:66");
        assert_eq!(neighbors[0].hops, 1);
        assert_eq!(neighbors[0].rssi, -60);
        assert_eq!(neighbors[1].rssi, -80);
    }

    #[test]
    fn test_declared_size_bounded_by_data() {
        let mut data = vec![31, 0, 0xFF, 0];
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 1, 0xD8]);
        assert_eq!(decode_mesh_neighbor_block(&data).unwrap().len(), 1);
    }

    #[test]
    fn test_response_classification() {
        assert_eq!(
            Response::decode(&[54, 0, 0, 0]).unwrap(),
            Response::Other(ResponseHeader {
                command: 54,
                status: 0,
                payload_size: 0
            })
        );
        assert!(Response::decode(&[16, 0]).is_err());
        assert_eq!(
            Response::decode(&[31, 0, 0, 0]).unwrap(),
            Response::MeshNeighbors(vec![])
        );
    }
}
