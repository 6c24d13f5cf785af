//! Accelerometer Processing
//!
//! Converts raw 10-bit accelerometer samples into g units using the
//! calibration stored on the controller, and tracks a resting orientation.

use tracing::debug;

/// Raw value at 0 g when no calibration was read.
pub const DEFAULT_ZERO: u16 = 512;
/// Raw value at 1 g when no calibration was read.
pub const DEFAULT_ONE: u16 = 616;

/// Readings within this distance of 1 g count as resting.
const QUIESCENT_TOLERANCE: f32 = 0.1;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn magnitude(&self) -> f32 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// Zero-g and one-g points per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    pub zero: [u16; 3],
    pub one: [u16; 3],
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            zero: [DEFAULT_ZERO; 3],
            one: [DEFAULT_ONE; 3],
        }
    }
}

impl Calibration {
    /// Size of the calibration block in controller memory.
    pub const BLOCK_SIZE: usize = 8;

    /// Parse the block at EEPROM 0x16:
    ///
    /// ```text
    /// [0-2] : zero point X, Y, Z (upper 8 bits)
    /// [3]   : zero point low bits, --XXYYZZ
    /// [4-6] : one-g point X, Y, Z (upper 8 bits)
    /// [7]   : one-g point low bits, --XXYYZZ
    /// ```
    pub fn from_block(block: &[u8]) -> Option<Self> {
        if block.len() < Self::BLOCK_SIZE {
            return None;
        }
        let point = |bytes: &[u8]| -> [u16; 3] {
            let low = bytes[3];
            [
                (bytes[0] as u16) << 2 | ((low >> 4) & 0b11) as u16,
                (bytes[1] as u16) << 2 | ((low >> 2) & 0b11) as u16,
                (bytes[2] as u16) << 2 | (low & 0b11) as u16,
            ]
        };
        let calibration = Self {
            zero: point(&block[0..4]),
            one: point(&block[4..8]),
        };
        if calibration.zero.iter().zip(calibration.one.iter()).any(|(z, o)| z == o) {
            debug!(target: "wiimote", "Degenerate calibration {:?}", calibration);
            return None;
        }
        Some(calibration)
    }

    /// `(raw - zero) / (one - zero)` per axis.
    pub fn normalize(&self, raw: [u16; 3]) -> Vec3 {
        let axis = |i: usize| {
            let span = self.one[i] as f32 - self.zero[i] as f32;
            (raw[i] as f32 - self.zero[i] as f32) / span
        };
        Vec3::new(axis(0), axis(1), axis(2))
    }
}

/// Polar form of an acceleration vector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Spherical {
    pub magnitude: f32,
    /// Rotation about the pointing axis, `atan2(x, z)`.
    pub roll: f32,
    /// `atan2(y, sqrt(x² + z²))`.
    pub pitch: f32,
}

impl Spherical {
    pub fn from_rect(v: Vec3) -> Self {
        Self {
            magnitude: v.magnitude(),
            roll: v.x.atan2(v.z),
            pitch: v.y.atan2((v.x * v.x + v.z * v.z).sqrt()),
        }
    }

    pub fn is_quiescent(&self) -> bool {
        (self.magnitude - 1.0).abs() <= QUIESCENT_TOLERANCE
    }
}

/// Accelerometer part of the controller state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accelerometer {
    /// Latest reading in g.
    pub rect: Vec3,
    pub spherical: Spherical,
    /// Last reading taken while the controller was roughly at rest.
    pub orientation: Spherical,
}

impl Accelerometer {
    pub fn update(&mut self, raw: [u16; 3], calibration: &Calibration) {
        self.rect = calibration.normalize(raw);
        self.spherical = Spherical::from_rect(self.rect);
        if self.spherical.is_quiescent() {
            self.orientation = self.spherical;
        }
    }
}
