//! Normalized controller state, as seen by applications after `poll`.

use crate::domain::cursor::{Cursor, IrDot};
use crate::domain::extension::ExtensionState;
use crate::domain::imu::Accelerometer;
use crate::domain::models::ConnectionStatus;

/// Bits of [`ControllerState::present`] telling which parts the last
/// report carried. Parts not present keep their previous values.
pub mod present {
    pub const BUTTONS: u32 = 1 << 0;
    pub const ACCELEROMETER: u32 = 1 << 1;
    /// Data came from an interleaved pair of reports.
    pub const INTERLACED: u32 = 1 << 2;
    pub const IR: u32 = 1 << 3;
    pub const EXTENSION: u32 = 1 << 4;
}

/// Core button bits, as they sit in the first two report bytes.
pub mod button {
    pub const DPAD_LEFT: u16 = 1 << 0;
    pub const DPAD_RIGHT: u16 = 1 << 1;
    pub const DPAD_DOWN: u16 = 1 << 2;
    pub const DPAD_UP: u16 = 1 << 3;
    pub const PLUS: u16 = 1 << 4;
    pub const TWO: u16 = 1 << 8;
    pub const ONE: u16 = 1 << 9;
    pub const B: u16 = 1 << 10;
    pub const A: u16 = 1 << 11;
    pub const MINUS: u16 = 1 << 12;
    pub const HOME: u16 = 1 << 15;
}

/// Button bitmask with edge detection between polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Buttons {
    /// Current state.
    pub state: u16,
    /// State at the previous poll.
    pub held: u16,
    /// Set for one poll when a button goes down.
    pub down: u16,
    /// Set for one poll when a button is released.
    pub up: u16,
}

impl Buttons {
    pub fn update(&mut self, next: u16) {
        let previous = self.state;
        self.state = next;
        self.held = previous;
        self.down = !previous & next;
        self.up = previous & !next;
    }

    pub fn is_pressed(&self, mask: u16) -> bool {
        self.state & mask != 0
    }

    pub fn was_pressed(&self, mask: u16) -> bool {
        self.down & mask != 0
    }

    pub fn was_released(&self, mask: u16) -> bool {
        self.up & mask != 0
    }
}

/// Format of the IR camera bytes in a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrFormat {
    /// 10 bytes for four dots, positions only.
    Basic,
    /// 3 bytes per dot, adds a size nibble.
    Extended,
    /// 9 bytes per dot, adds bounding box and intensity.
    Full,
}

impl IrFormat {
    /// Value of the camera mode register for this format.
    pub fn register_value(self) -> u8 {
        match self {
            Self::Basic => 0x01,
            Self::Extended => 0x03,
            Self::Full => 0x05,
        }
    }
}

/// Everything known about one controller slot.
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    pub status: ConnectionStatus,
    /// [`present`] bits of the last decoded report.
    pub present: u32,
    pub buttons: Buttons,
    pub accelerometer: Accelerometer,
    pub ir: [IrDot; 4],
    pub cursor: Cursor,
    pub extension: ExtensionState,
    pub battery: u8,
}

impl ControllerState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn has(&self, mask: u32) -> bool {
        self.present & mask != 0
    }
}
