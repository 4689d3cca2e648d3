//! Command envelope and per-device sequence state.
//!
//! Every packet written to a bulb starts with a 6-byte envelope:
//! network key (u32 LE), sequence number (u8, always even) and command id.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Envelope size in bytes
pub const ENVELOPE_SIZE: usize = 6;

/// Response header size in bytes (command, status, payload size)
pub const RESPONSE_HEADER_SIZE: usize = 4;

/// Command ids understood by the bulbs
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandId {
    /// Set color, no response expected
    SetColor = 0,
    /// Set the power-on default color
    SetDefaultColor = 1,
    /// Turn on with delay/transit
    TurnOn = 4,
    /// Turn off with delay/transit
    TurnOff = 5,
    /// Upload a scene
    SetColorPattern = 7,
    /// Start a stored scene
    StartColorPattern = 8,
    /// Daily alarm
    SetDailyAlarm = 9,
    /// Query current color
    GetBulbColor = 16,
    /// Mesh proxy message
    ProxyMsg = 28,
    /// Query mesh routing neighbors
    QueryRouting = 31,
    /// Candle flicker mode
    SetCandleMode = 35,
    /// Fade to a color
    SetColorSmooth = 37,
    /// Query firmware/hardware info
    GetDeviceInfo = 40,
    /// Add a scheduled action
    AddAction = 50,
    /// One fragment of a chunked payload
    DataChunk = 52,
    /// Set color and acknowledge
    SetColorNeedResp = 54,
    /// Join a network with key, node and group ids
    CommissionWithId = 58,
    /// Configuration sub-commands
    Config = 65,
    /// Tree mesh proxy message
    TreeMeshProxy = 68,
}

impl TryFrom<u8> for CommandId {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CommandId::SetColor),
            1 => Ok(CommandId::SetDefaultColor),
            4 => Ok(CommandId::TurnOn),
            5 => Ok(CommandId::TurnOff),
            7 => Ok(CommandId::SetColorPattern),
            8 => Ok(CommandId::StartColorPattern),
            9 => Ok(CommandId::SetDailyAlarm),
            16 => Ok(CommandId::GetBulbColor),
            28 => Ok(CommandId::ProxyMsg),
            31 => Ok(CommandId::QueryRouting),
            35 => Ok(CommandId::SetCandleMode),
            37 => Ok(CommandId::SetColorSmooth),
            40 => Ok(CommandId::GetDeviceInfo),
            50 => Ok(CommandId::AddAction),
            52 => Ok(CommandId::DataChunk),
            54 => Ok(CommandId::SetColorNeedResp),
            58 => Ok(CommandId::CommissionWithId),
            65 => Ok(CommandId::Config),
            68 => Ok(CommandId::TreeMeshProxy),
            _ => Err(crate::WireError::Type(value)),
        }
    }
}

/// Sub-commands carried by [`CommandId::Config`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigCommand {
    /// Reboot into the DFU bootloader
    EnterBootloader = 2,
}

/// Command envelope (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    /// Shared network key
    pub network_key: u32,
    /// Sequence number, always even
    pub seq_num: u8,
    /// Command id
    pub command: CommandId,
}

impl Envelope {
    /// Encode the envelope (little-endian key)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.network_key);
        buf.put_u8(self.seq_num);
        buf.put_u8(self.command as u8);
    }

    /// Decode an envelope from the front of `buf`
    pub fn decode(buf: &mut impl Buf) -> Result<Self, crate::WireError> {
        if buf.remaining() < ENVELOPE_SIZE {
            return Err(crate::WireError::incomplete(ENVELOPE_SIZE, buf.remaining()));
        }

        let network_key = buf.get_u32_le();
        let seq_num = buf.get_u8();
        let command = CommandId::try_from(buf.get_u8())?;

        Ok(Self {
            network_key,
            seq_num,
            command,
        })
    }
}

/// Network key and sequence counter for one device.
///
/// The counter is advanced by every envelope; callers persist
/// [`NetworkState::seq_num`] after each [`NetworkState::next_envelope`] and
/// before issuing the write the envelope belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetworkState {
    /// Shared network key
    pub network_key: u32,
    /// Next sequence number to use (evened before use)
    pub seq_num: u8,
}

impl NetworkState {
    /// Create state from a key and a stored counter
    pub fn new(network_key: u32, seq_num: u8) -> Self {
        Self {
            network_key,
            seq_num,
        }
    }

    /// Produce the envelope for the next command and advance the counter by two
    pub fn next_envelope(&mut self, command: CommandId) -> Envelope {
        if self.seq_num % 2 != 0 {
            self.seq_num = self.seq_num.wrapping_add(1);
        }

        let envelope = Envelope {
            network_key: self.network_key,
            seq_num: self.seq_num,
            command,
        };

        self.seq_num = self.seq_num.wrapping_add(2);
        envelope
    }

    /// Encode the next envelope straight into `buf`
    pub fn pack(&mut self, command: CommandId, buf: &mut BytesMut) -> Envelope {
        let envelope = self.next_envelope(command);
        envelope.encode(buf);
        envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_id_conversion() {
        assert_eq!(CommandId::try_from(0).unwrap(), CommandId::SetColor);
        assert_eq!(CommandId::try_from(31).unwrap(), CommandId::QueryRouting);
        assert_eq!(CommandId::try_from(65).unwrap(), CommandId::Config);
        assert!(CommandId::try_from(0xFF).is_err());
    }

    #[test]
    fn test_envelope_layout() {
        let mut state = NetworkState::new(0xDEADBEEF, 4);
        let mut buf = BytesMut::new();
        state.pack(CommandId::TurnOn, &mut buf);

        assert_eq!(&buf[..], &[0xEF, 0xBE, 0xAD, 0xDE, 4, 4]);

        let decoded = Envelope::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded.network_key, 0xDEADBEEF);
        assert_eq!(decoded.seq_num, 4);
        assert_eq!(decoded.command, CommandId::TurnOn);
    }

    #[test]
    fn test_sequence_always_even_and_advances_by_two() {
        for start in 0..=255u8 {
            let mut state = NetworkState::new(1, start);
            let envelope = state.next_envelope(CommandId::SetColor);
            assert_eq!(envelope.seq_num % 2, 0, "start={}", start);
            assert_eq!(state.seq_num, envelope.seq_num.wrapping_add(2), "start={}", start);
        }
    }

    #[test]
    fn test_sequence_odd_start_is_bumped() {
        let mut state = NetworkState::new(0, 3);
        assert_eq!(state.next_envelope(CommandId::SetColor).seq_num, 4);
        assert_eq!(state.seq_num, 6);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut state = NetworkState::new(0, 255);
        assert_eq!(state.next_envelope(CommandId::SetColor).seq_num, 0);
        assert_eq!(state.seq_num, 2);

        let mut state = NetworkState::new(0, 254);
        assert_eq!(state.next_envelope(CommandId::SetColor).seq_num, 254);
        assert_eq!(state.seq_num, 0);
    }

    #[test]
    fn test_envelope_decode_incomplete() {
        let mut short = bytes::Bytes::from_static(&[1, 2, 3]);
        assert!(Envelope::decode(&mut short).is_err());
    }
}
