//! Command payload encoding.
//!
//! Each helper produces the payload that follows the [`Envelope`]. [`Command`]
//! ties a payload to its command id so a whole packet can be built against a
//! [`NetworkState`].

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::header::{CommandId, ConfigCommand, Envelope, NetworkState, ENVELOPE_SIZE};
use crate::WireError;

/// Longest duration (ms) that still fits the millisecond unit
pub const SMOOTH_MS_CEILING: u32 = 65_535;

/// Scene header size following the envelope
pub const SCENE_HEADER_SIZE: usize = 7;

/// Encoded size of one scene frame
pub const SCENE_FRAME_SIZE: usize = 18;

/// Maximum frames in a scene
pub const MAX_SCENE_FRAMES: usize = 255;

/// Repeat count meaning "loop forever"
pub const REPEAT_FOREVER: u8 = 255;

fn clamp_channel(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// A color as five 8-bit channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColorFrame {
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

impl ColorFrame {
    /// Build a frame, clamping every channel to 0..=255
    pub fn new(r: i32, g: i32, b: i32, w: i32, brightness: i32) -> Self {
        Self {
            r: clamp_channel(r),
            g: clamp_channel(g),
            b: clamp_channel(b),
            w: clamp_channel(w),
            brightness: clamp_channel(brightness),
        }
    }

    /// Channels in wire order
    pub fn channels(&self) -> [u8; 5] {
        [self.r, self.g, self.b, self.w, self.brightness]
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.channels());
    }
}

/// Color payload: 5 channels and 2 reserved bytes
pub fn encode_color(color: &ColorFrame, buf: &mut BytesMut) {
    color.put(buf);
    buf.put_u8(0);
    buf.put_u8(0);
}

/// Fade payload.
///
/// Durations under [`SMOOTH_MS_CEILING`] are sent in milliseconds, longer
/// ones in whole seconds.
pub fn encode_color_smooth(color: &ColorFrame, duration_ms: u32, delay_sec: u32, buf: &mut BytesMut) {
    let (time_val, unit) = if duration_ms < SMOOTH_MS_CEILING {
        (duration_ms as u16, 0u8)
    } else {
        ((duration_ms / 1000).min(u16::MAX as u32) as u16, 1u8)
    };

    buf.put_u16_le(time_val);
    buf.put_u8(unit);
    color.put(buf);
    buf.put_u8(0);
    buf.put_u8(delay_sec.min(u8::MAX as u32) as u8);
}

/// Turn on/off payload
pub fn encode_turn(delay: u16, transit: u16, buf: &mut BytesMut) {
    buf.put_u16_le(delay);
    buf.put_u16_le(transit);
}

/// Commission payload: key, node id, group id
pub fn encode_commission(network_key: u32, group_id: u16, node_id: u16, buf: &mut BytesMut) {
    buf.put_u32_le(network_key);
    buf.put_u16_le(node_id);
    buf.put_u16_le(group_id);
}

/// CONFIG payload that reboots into the bootloader
pub fn encode_enter_bootloader(dfu_key: u32, buf: &mut BytesMut) {
    buf.put_u8(ConfigCommand::EnterBootloader as u8);
    buf.put_u32_le(dfu_key);
}

/// Start-pattern payload
pub fn encode_start_pattern(scene_idx: u8, buf: &mut BytesMut) {
    buf.put_u8(scene_idx);
}

/// One step of a scene
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneFrame {
    /// Color shown during the step
    pub color: ColorFrame,
    /// How long the color is held
    #[serde(default = "SceneFrame::default_sustain")]
    pub sustain_ms: u32,
    /// Transition time into the color
    #[serde(default = "SceneFrame::default_transit")]
    pub transit_ms: u32,
}

impl SceneFrame {
    fn default_sustain() -> u32 {
        500
    }

    fn default_transit() -> u32 {
        100
    }

    /// Frame with default timings (500 ms sustain, 100 ms transit)
    pub fn new(color: ColorFrame) -> Self {
        Self {
            color,
            sustain_ms: Self::default_sustain(),
            transit_ms: Self::default_transit(),
        }
    }

    fn put(&self, buf: &mut BytesMut) {
        self.color.put(buf);
        buf.put_u8(0);
        buf.put_u32_le(self.sustain_ms);
        buf.put_u32_le(self.transit_ms);
        buf.put_slice(&[0, 0, 0, 0]);
    }
}

/// A color pattern stored on the bulb
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scene {
    /// Slot the scene is stored in
    #[serde(default)]
    pub scene_idx: u8,
    /// Repeat count, 255 loops forever
    #[serde(default)]
    pub repeatable: u8,
    /// Start playback right after upload
    #[serde(default = "default_start_now")]
    pub start_now: bool,
    /// Ordered frames
    pub frames: Vec<SceneFrame>,
}

fn default_start_now() -> bool {
    true
}

/// Scene upload payload
pub fn encode_scene(scene: &Scene, buf: &mut BytesMut) -> Result<(), WireError> {
    let count = scene.frames.len();
    if count == 0 || count > MAX_SCENE_FRAMES {
        return Err(WireError::Size(count));
    }

    let total = ENVELOPE_SIZE + SCENE_HEADER_SIZE + SCENE_FRAME_SIZE * count;
    buf.reserve(SCENE_HEADER_SIZE + SCENE_FRAME_SIZE * count);
    buf.put_u16_le(total as u16);
    buf.put_u8(scene.scene_idx);
    buf.put_u8(count as u8);
    buf.put_u8(scene.repeatable);
    buf.put_u8(scene.scene_idx);
    buf.put_u8(scene.start_now as u8);

    for frame in &scene.frames {
        frame.put(buf);
    }
    Ok(())
}

/// A command with its payload arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Set color without acknowledgement
    SetColor(ColorFrame),
    /// Set color with acknowledgement
    SetColorNeedResp(ColorFrame),
    /// Fade to a color
    SetColorSmooth {
        /// Target color
        color: ColorFrame,
        /// Fade duration
        duration_ms: u32,
        /// Delay before starting
        delay_sec: u32,
    },
    /// Candle flicker around a color
    SetCandleMode(ColorFrame),
    /// Turn on
    TurnOn {
        /// Delay before switching
        delay: u16,
        /// Transition time
        transit: u16,
    },
    /// Turn off
    TurnOff {
        /// Delay before switching
        delay: u16,
        /// Transition time
        transit: u16,
    },
    /// Upload a scene
    SetColorPattern(Scene),
    /// Play a stored scene
    StartColorPattern(u8),
    /// Query current color
    GetBulbColor,
    /// Query device info
    GetDeviceInfo,
    /// Query mesh routing neighbors
    QueryRouting,
    /// Join a network
    Commission {
        /// New network key
        network_key: u32,
        /// Group id
        group_id: u16,
        /// Node id
        node_id: u16,
    },
    /// Reboot into the bootloader
    EnterBootloader {
        /// Bootloader unlock key
        dfu_key: u32,
    },
}

impl Command {
    /// Command id placed in the envelope
    pub fn id(&self) -> CommandId {
        match self {
            Command::SetColor(_) => CommandId::SetColor,
            Command::SetColorNeedResp(_) => CommandId::SetColorNeedResp,
            Command::SetColorSmooth { .. } => CommandId::SetColorSmooth,
            Command::SetCandleMode(_) => CommandId::SetCandleMode,
            Command::TurnOn { .. } => CommandId::TurnOn,
            Command::TurnOff { .. } => CommandId::TurnOff,
            Command::SetColorPattern(_) => CommandId::SetColorPattern,
            Command::StartColorPattern(_) => CommandId::StartColorPattern,
            Command::GetBulbColor => CommandId::GetBulbColor,
            Command::GetDeviceInfo => CommandId::GetDeviceInfo,
            Command::QueryRouting => CommandId::QueryRouting,
            Command::Commission { .. } => CommandId::CommissionWithId,
            Command::EnterBootloader { .. } => CommandId::Config,
        }
    }

    /// Append the payload (without envelope)
    pub fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Command::SetColor(c) | Command::SetColorNeedResp(c) | Command::SetCandleMode(c) => {
                encode_color(c, buf)
            }
            Command::SetColorSmooth {
                color,
                duration_ms,
                delay_sec,
            } => encode_color_smooth(color, *duration_ms, *delay_sec, buf),
            Command::TurnOn { delay, transit } | Command::TurnOff { delay, transit } => {
                encode_turn(*delay, *transit, buf)
            }
            Command::SetColorPattern(scene) => encode_scene(scene, buf)?,
            Command::StartColorPattern(idx) => encode_start_pattern(*idx, buf),
            Command::GetBulbColor | Command::GetDeviceInfo | Command::QueryRouting => {}
            Command::Commission {
                network_key,
                group_id,
                node_id,
            } => encode_commission(*network_key, *group_id, *node_id, buf),
            Command::EnterBootloader { dfu_key } => encode_enter_bootloader(*dfu_key, buf),
        }
        Ok(())
    }

    /// Build envelope and payload, advancing `state`.
    ///
    /// The payload is encoded first so a rejected command does not consume a
    /// sequence number.
    pub fn build(&self, state: &mut NetworkState) -> Result<(Envelope, Bytes), WireError> {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload)?;

        let mut buf = BytesMut::with_capacity(ENVELOPE_SIZE + payload.len());
        let envelope = state.pack(self.id(), &mut buf);
        buf.put_slice(&payload);
        Ok((envelope, buf.freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_clamping() {
        let c = ColorFrame::new(300, -5, 128, 0, 255);
        assert_eq!(c.channels(), [255, 0, 128, 0, 255]);
    }

    #[test]
    fn test_encode_color() {
        let mut buf = BytesMut::new();
        encode_color(&ColorFrame::new(1, 2, 3, 4, 5), &mut buf);
        assert_eq!(&buf[..], &[1, 2, 3, 4, 5, 0, 0]);
    }

    #[test]
    fn test_encode_color_smooth_units() {
        let color = ColorFrame::new(10, 20, 30, 40, 50);

        let mut buf = BytesMut::new();
        encode_color_smooth(&color, 1000, 3, &mut buf);
        assert_eq!(&buf[..], &[0xE8, 0x03, 0, 10, 20, 30, 40, 50, 0, 3]);

        let mut buf = BytesMut::new();
        encode_color_smooth(&color, 65_535, 0, &mut buf);
        assert_eq!(&buf[..3], &[65, 0, 1]);

        let mut buf = BytesMut::new();
        encode_color_smooth(&color, 65_534, 0, &mut buf);
        assert_eq!(&buf[..3], &[0xFE, 0xFF, 0]);
    }

    #[test]
    fn test_encode_scene() {
        let scene = Scene {
            scene_idx: 2,
            repeatable: REPEAT_FOREVER,
            start_now: true,
            frames: vec![
                SceneFrame::new(ColorFrame::new(255, 0, 0, 0, 255)),
                SceneFrame {
                    color: ColorFrame::new(0, 0, 255, 0, 128),
                    sustain_ms: 1000,
                    transit_ms: 200,
                },
            ],
        };

        let mut buf = BytesMut::new();
        encode_scene(&scene, &mut buf).unwrap();

        assert_eq!(buf.len(), SCENE_HEADER_SIZE + 2 * SCENE_FRAME_SIZE);
        assert_eq!(&buf[..7], &[49, 0, 2, 2, 255, 2, 1]);
        assert_eq!(
            &buf[7..25],
            &[255, 0, 0, 0, 255, 0, 0xF4, 0x01, 0, 0, 100, 0, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(&buf[31..35], &[0xE8, 0x03, 0, 0]);
    }

    #[test]
    fn test_encode_scene_frame_limits() {
        let mut buf = BytesMut::new();
        let empty = Scene {
            scene_idx: 0,
            repeatable: 0,
            start_now: false,
            frames: vec![],
        };
        assert_eq!(encode_scene(&empty, &mut buf), Err(WireError::Size(0)));

        let too_many = Scene {
            frames: vec![SceneFrame::new(ColorFrame::default()); 256],
            ..empty
        };
        assert_eq!(encode_scene(&too_many, &mut buf), Err(WireError::Size(256)));
    }

    #[test]
    fn test_commission_and_bootloader_payloads() {
        let mut buf = BytesMut::new();
        encode_commission(0x11223344, 7, 3, &mut buf);
        assert_eq!(&buf[..], &[0x44, 0x33, 0x22, 0x11, 3, 0, 7, 0]);

        let mut buf = BytesMut::new();
        encode_enter_bootloader(0x12345678, &mut buf);
        assert_eq!(&buf[..], &[2, 0x78, 0x56, 0x34, 0x12]);
    }

    #[test]
    fn test_command_build() {
        let mut state = NetworkState::new(1, 0);
        let (envelope, packet) = Command::TurnOff {
            delay: 0,
            transit: 500,
        }
        .build(&mut state)
        .unwrap();

        assert_eq!(envelope.command, CommandId::TurnOff);
        assert_eq!(&packet[..], &[1, 0, 0, 0, 0, 5, 0, 0, 0xF4, 0x01]);
        assert_eq!(state.seq_num, 2);
    }

    #[test]
    fn test_failed_build_keeps_sequence() {
        let mut state = NetworkState::new(1, 8);
        let empty = Scene {
            scene_idx: 0,
            repeatable: 0,
            start_now: true,
            frames: vec![],
        };
        assert!(Command::SetColorPattern(empty).build(&mut state).is_err());
        assert_eq!(state.seq_num, 8);
    }

    #[test]
    fn test_scene_json_defaults() {
        let scene: Scene = serde_json::from_str(
            r#"{"frames":[{"color":{"r":1,"g":2,"b":3,"w":0,"brightness":255}}]}"#,
        )
        .unwrap();
        assert!(scene.start_now);
        assert_eq!(scene.frames[0].sustain_ms, 500);
        assert_eq!(scene.frames[0].transit_ms, 100);
    }
}
