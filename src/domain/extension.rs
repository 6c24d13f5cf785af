//! Extension Controllers
//!
//! Identifies the peripheral plugged into the controller's expansion port
//! and decodes the 6-byte data block the supported ones report.

use crate::domain::controller::Buttons;
use crate::domain::imu::Vec3;
use tracing::error;

pub mod nunchuk_button {
    pub const Z: u16 = 1 << 0;
    pub const C: u16 = 1 << 1;
}

pub mod classic_button {
    pub const DPAD_UP: u16 = 1 << 0;
    pub const DPAD_LEFT: u16 = 1 << 1;
    pub const ZR: u16 = 1 << 2;
    pub const X: u16 = 1 << 3;
    pub const A: u16 = 1 << 4;
    pub const Y: u16 = 1 << 5;
    pub const B: u16 = 1 << 6;
    pub const ZL: u16 = 1 << 7;
    pub const RIGHT_TRIGGER: u16 = 1 << 9;
    pub const PLUS: u16 = 1 << 10;
    pub const HOME: u16 = 1 << 11;
    pub const MINUS: u16 = 1 << 12;
    pub const LEFT_TRIGGER: u16 = 1 << 13;
    pub const DPAD_DOWN: u16 = 1 << 14;
    pub const DPAD_RIGHT: u16 = 1 << 15;
}

/// Bytes of extension data the decoders need.
pub const DATA_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExtensionType {
    #[default]
    None,
    Nunchuk,
    ClassicController,
    ClassicControllerPro,
    DrawsomeTablet,
    GuitarHeroGuitar,
    GuitarHeroDrums,
    DjHeroTurntable,
    TaikoDrums,
    UDrawTablet,
    ShinkansenController,
    BalanceBoard,
}

impl ExtensionType {
    /// Look up the 6-byte identifier read from 0x04A400FA.
    pub fn from_id(id: &[u8; 6]) -> Self {
        let code = id.iter().fold(0u64, |acc, b| acc << 8 | *b as u64);
        match code {
            0x0000_A420_0000 => Self::Nunchuk,
            0x0000_A420_0101 => Self::ClassicController,
            0x0100_A420_0101 => Self::ClassicControllerPro,
            0xFF00_A420_0013 => Self::DrawsomeTablet,
            0x0000_A420_0103 => Self::GuitarHeroGuitar,
            0x0100_A420_0103 => Self::GuitarHeroDrums,
            0x0300_A420_0103 => Self::DjHeroTurntable,
            0x0000_A420_0111 => Self::TaikoDrums,
            0xFF00_A420_0112 => Self::UDrawTablet,
            0x0000_A420_0310 => Self::ShinkansenController,
            0x0000_A420_0402 => Self::BalanceBoard,
            _ => {
                error!(target: "wiimote", "Unknown extension code: {:012X}", code);
                Self::None
            }
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Nunchuk => "Nunchuk",
            Self::ClassicController => "Classic Controller",
            Self::ClassicControllerPro => "Classic Controller Pro",
            Self::DrawsomeTablet => "Drawsome Graphics Tablet",
            Self::GuitarHeroGuitar => "Guitar Hero Guitar",
            Self::GuitarHeroDrums => "Guitar Hero Drums",
            Self::DjHeroTurntable => "DJ Hero Turntable",
            Self::TaikoDrums => "Taiko no Tatsujin TaTaCon Drum",
            Self::UDrawTablet => "uDraw Game Tablet",
            Self::ShinkansenController => "Densha de GO! Shinkansen Controller",
            Self::BalanceBoard => "Wii Balance Board",
        }
    }

    /// Whether [`ExtensionState::update`] can decode this type's data.
    pub fn is_decodable(self) -> bool {
        matches!(self, Self::Nunchuk | Self::ClassicController)
    }
}

/// Horizontal and vertical stick deflection, -1.0..=1.0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Stick {
    pub x: f32,
    pub y: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum ExtensionData {
    #[default]
    None,
    Nunchuk {
        buttons: Buttons,
        stick: Stick,
        accelerometer: Vec3,
    },
    Classic {
        buttons: Buttons,
        left_stick: Stick,
        right_stick: Stick,
        /// 0.0..=1.0
        left_trigger: f32,
        right_trigger: f32,
    },
}

impl ExtensionData {
    fn buttons(&self) -> Buttons {
        match self {
            Self::None => Buttons::default(),
            Self::Nunchuk { buttons, .. } | Self::Classic { buttons, .. } => *buttons,
        }
    }
}

/// Extension part of the controller state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExtensionState {
    pub kind: ExtensionType,
    pub data: ExtensionData,
}

impl ExtensionState {
    pub fn attached(kind: ExtensionType) -> Self {
        Self {
            kind,
            data: ExtensionData::None,
        }
    }

    /// Decode a block of extension bytes, zeroing the data when the type
    /// is unsupported or the block is too short.
    pub fn update(&mut self, bytes: &[u8]) {
        if bytes.len() < DATA_SIZE {
            self.data = ExtensionData::None;
            return;
        }
        let mut buttons = self.data.buttons();
        self.data = match self.kind {
            ExtensionType::Nunchuk => decode_nunchuk(&mut buttons, bytes),
            ExtensionType::ClassicController => decode_classic(&mut buttons, bytes),
            _ => ExtensionData::None,
        };
    }
}

fn decode_nunchuk(buttons: &mut Buttons, data: &[u8]) -> ExtensionData {
    let stick_x = data[0] as i32 - 128;
    let stick_y = data[1] as i32 - 128;
    let accel_x = (data[2] as i32) << 2 | (data[5] as i32 >> 6) & 0b11;
    let accel_y = (data[3] as i32) << 2 | (data[5] as i32 >> 4) & 0b11;
    let accel_z = (data[4] as i32) << 2 | (data[5] as i32 >> 2) & 0b11;

    // Buttons are active low.
    buttons.update((data[5] as u16 & 0b11) ^ 0b11);

    // The stick's travel is not symmetric.
    let stick = Stick {
        x: stick_x as f32 / if stick_x > 0 { 100.0 } else { 93.0 },
        y: stick_y as f32 / if stick_y > 0 { 92.0 } else { 101.0 },
    };
    let accel = |raw: i32| (raw - 512) as f32 / 512.0;

    ExtensionData::Nunchuk {
        buttons: *buttons,
        stick,
        accelerometer: Vec3::new(accel(accel_x), accel(accel_y), accel(accel_z)),
    }
}

/// Data format 1: 6-bit left stick, 5-bit right stick and triggers.
fn decode_classic(buttons: &mut Buttons, data: &[u8]) -> ExtensionData {
    let d = |i: usize| data[i] as i32;
    let left_x = d(0) & 0b11_1111;
    let left_y = d(1) & 0b11_1111;
    let right_x = (d(2) >> 7) | ((d(1) >> 6) & 0b11) << 1 | ((d(0) >> 6) & 0b11) << 3;
    let right_y = d(2) & 0b1_1111;
    let left_trigger = (d(3) >> 5) | ((d(2) >> 5) & 0b11) << 3;
    let right_trigger = d(3) & 0b1_1111;

    buttons.update(u16::from_be_bytes([data[4], data[5]]) ^ 0xFFFF);

    let axis = |v: i32, max: f32| v as f32 / max * 2.0 - 1.0;
    ExtensionData::Classic {
        buttons: *buttons,
        left_stick: Stick {
            x: axis(left_x, 63.0),
            y: axis(left_y, 63.0),
        },
        right_stick: Stick {
            x: axis(right_x, 31.0),
            y: axis(right_y, 31.0),
        },
        left_trigger: left_trigger as f32 / 31.0,
        right_trigger: right_trigger as f32 / 31.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_ids() {
        assert_eq!(
            ExtensionType::from_id(&[0x00, 0x00, 0xA4, 0x20, 0x00, 0x00]),
            ExtensionType::Nunchuk
        );
        assert_eq!(
            ExtensionType::from_id(&[0x01, 0x00, 0xA4, 0x20, 0x01, 0x01]),
            ExtensionType::ClassicControllerPro
        );
        assert_eq!(
            ExtensionType::from_id(&[0x00, 0x00, 0xA4, 0x20, 0x04, 0x02]),
            ExtensionType::BalanceBoard
        );
        assert_eq!(ExtensionType::from_id(&[0xFF; 6]), ExtensionType::None);
    }

    #[test]
    fn test_nunchuk_at_rest() {
        let mut state = ExtensionState::attached(ExtensionType::Nunchuk);
        state.update(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x03]);

        let ExtensionData::Nunchuk {
            buttons,
            stick,
            accelerometer,
        } = state.data
        else {
            panic!("expected nunchuk data, got {:?}", state.data);
        };
        assert_eq!(buttons.state, 0);
        assert_eq!(buttons.down, 0);
        assert_eq!(stick, Stick::default());
        assert_eq!(accelerometer, Vec3::default());
    }

    #[test]
    fn test_nunchuk_button_edges() {
        let mut state = ExtensionState::attached(ExtensionType::Nunchuk);
        // Z pressed (bit 0 low)
        state.update(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x02]);
        state.update(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x03]);

        let ExtensionData::Nunchuk { buttons, .. } = state.data else {
            panic!("expected nunchuk data");
        };
        assert_eq!(buttons.state, 0);
        assert_eq!(buttons.held, nunchuk_button::Z);
        assert_eq!(buttons.up, nunchuk_button::Z);
        assert_eq!(buttons.down, 0);
    }

    #[test]
    fn test_classic_centered() {
        let mut state = ExtensionState::attached(ExtensionType::ClassicController);
        // left stick 32/32 of 63, right stick 16/16 of 31, triggers 0, A pressed
        let right_x = 16;
        let b0 = 32 | ((right_x >> 3) & 0b11) << 6;
        let b1 = 32 | ((right_x >> 1) & 0b11) << 6;
        let b2 = (right_x & 1) << 7 | 16;
        state.update(&[b0, b1, b2, 0x00, 0xFF, !(classic_button::A as u8)]);

        let ExtensionData::Classic {
            buttons,
            left_stick,
            right_stick,
            left_trigger,
            right_trigger,
        } = state.data
        else {
            panic!("expected classic data");
        };
        assert_eq!(buttons.state, classic_button::A);
        assert!((left_stick.x - (32.0 / 63.0 * 2.0 - 1.0)).abs() < 1e-6);
        assert!((right_stick.x - (16.0 / 31.0 * 2.0 - 1.0)).abs() < 1e-6);
        assert!((right_stick.y - (16.0 / 31.0 * 2.0 - 1.0)).abs() < 1e-6);
        assert_eq!(left_trigger, 0.0);
        assert_eq!(right_trigger, 0.0);
    }

    #[test]
    fn test_unsupported_and_short_data_zeroed() {
        let mut state = ExtensionState::attached(ExtensionType::GuitarHeroGuitar);
        state.update(&[0u8; 6]);
        assert_eq!(state.data, ExtensionData::None);

        let mut state = ExtensionState::attached(ExtensionType::Nunchuk);
        state.update(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x03]);
        state.update(&[0x80, 0x80]);
        assert_eq!(state.data, ExtensionData::None);
        assert_eq!(state.kind, ExtensionType::Nunchuk);
    }
}
