//! Wiimote HID wire format.
//!
//! Every packet on the interrupt channel starts with a HID transaction byte
//! (`0xA1` input, `0xA2` output) followed by the report id. Multi-byte
//! fields inside reports are big-endian, unlike the rest of the stack.

use crate::domain::controller::IrFormat;
use crate::error::{BtError, Result};

pub const INPUT_REPORT: u8 = 0xA1;
pub const OUTPUT_REPORT: u8 = 0xA2;

/// Output report ids.
pub mod output {
    pub const RUMBLE: u8 = 0x10;
    pub const LEDS: u8 = 0x11;
    pub const REPORT_MODE: u8 = 0x12;
    pub const IR_CLOCK: u8 = 0x13;
    pub const STATUS_REQUEST: u8 = 0x15;
    pub const WRITE_MEMORY: u8 = 0x16;
    pub const READ_MEMORY: u8 = 0x17;
    pub const IR_ENABLE: u8 = 0x1A;
}

/// Input report ids outside the data report range.
pub mod input {
    pub const STATUS: u8 = 0x20;
    pub const READ_DATA: u8 = 0x21;
    pub const ACKNOWLEDGE: u8 = 0x22;
}

/// Data reporting modes.
pub mod report {
    pub const BUTTONS: u8 = 0x30;
    pub const BUTTONS_ACCEL: u8 = 0x31;
    pub const BUTTONS_EXT8: u8 = 0x32;
    pub const BUTTONS_ACCEL_IR12: u8 = 0x33;
    pub const BUTTONS_EXT19: u8 = 0x34;
    pub const BUTTONS_ACCEL_EXT16: u8 = 0x35;
    pub const BUTTONS_IR10_EXT9: u8 = 0x36;
    pub const BUTTONS_ACCEL_IR10_EXT6: u8 = 0x37;
    pub const EXT21: u8 = 0x3D;
    pub const INTERLEAVED_A: u8 = 0x3E;
    pub const INTERLEAVED_B: u8 = 0x3F;

    const LENGTHS: [usize; 16] = [2, 5, 10, 17, 21, 21, 21, 21, 0, 0, 0, 0, 0, 21, 21, 21];

    /// Payload length of a data report, 0 for unused ids.
    pub fn length(code: u8) -> usize {
        match code {
            0x30..=0x3F => LENGTHS[(code - 0x30) as usize],
            _ => 0,
        }
    }

    pub fn is_data(code: u8) -> bool {
        length(code) != 0
    }
}

/// Addresses in the controller's memory spaces.
pub mod register {
    /// EEPROM block holding accelerometer calibration.
    pub const CALIBRATION: u32 = 0x0000_0016;
    pub const IR_CONTROL: u32 = 0x04B0_0030;
    pub const IR_BLOCK1: u32 = 0x04B0_0000;
    pub const IR_BLOCK2: u32 = 0x04B0_001A;
    pub const IR_MODE: u32 = 0x04B0_0033;
    pub const EXTENSION_INIT1: u32 = 0x04A4_00F0;
    pub const EXTENSION_INIT2: u32 = 0x04A4_00FB;
    pub const EXTENSION_ID: u32 = 0x04A4_00FA;
}

/// Bits of the status report flags byte.
pub mod flags {
    pub const BATTERY_NEAR_EMPTY: u8 = 0x01;
    pub const EXTENSION_CONNECTED: u8 = 0x02;
    pub const SPEAKER_ENABLED: u8 = 0x04;
    pub const IR_ENABLED: u8 = 0x08;
}

/// Largest payload of one memory write.
pub const MAX_WRITE: usize = 16;

/// Camera sensitivity programs: 9 bytes for block 1, 2 for block 2.
pub const SENSITIVITY: [[u8; 11]; 5] = [
    [0x02, 0x00, 0x00, 0x71, 0x01, 0x00, 0x64, 0x00, 0xfe, 0xfd, 0x05],
    [0x02, 0x00, 0x00, 0x71, 0x01, 0x00, 0x96, 0x00, 0xb4, 0xb3, 0x04],
    [0x02, 0x00, 0x00, 0x71, 0x01, 0x00, 0xaa, 0x00, 0x64, 0x63, 0x03],
    [0x02, 0x00, 0x00, 0x71, 0x01, 0x00, 0xc8, 0x00, 0x36, 0x35, 0x03],
    [0x07, 0x00, 0x00, 0x71, 0x01, 0x00, 0x72, 0x00, 0x20, 0x1f, 0x03],
];

pub const DEFAULT_SENSITIVITY: usize = 2;

pub const WHITELIST_COD: [u32; 2] = [0x002504, 0x480400];
pub const WHITELIST_NAMES: [&str; 2] = ["Nintendo RVL-CNT-01", "Nintendo RVL-CNT-01-TR"];

/// Class of device or remote name identifies a Wiimote.
pub fn is_wiimote(class_of_device: u32, name: &str) -> bool {
    WHITELIST_COD.contains(&class_of_device) || WHITELIST_NAMES.contains(&name)
}

/// Player LED for a slot.
pub fn led_mask(slot: usize) -> u8 {
    0x10 << (slot & 3)
}

/// IR format the camera must use for a reporting mode.
pub fn ir_format(report_mode: u8) -> IrFormat {
    match report_mode {
        report::BUTTONS_ACCEL_IR12 => IrFormat::Extended,
        report::INTERLEAVED_A | report::INTERLEAVED_B => IrFormat::Full,
        _ => IrFormat::Basic,
    }
}

/// `{0xA2, id, payload..}`, with the rumble bit set in the first payload byte.
pub fn output_report(id: u8, payload: &[u8], rumble: bool) -> Vec<u8> {
    let mut packet = Vec::with_capacity(2 + payload.len());
    packet.push(OUTPUT_REPORT);
    packet.push(id);
    packet.extend_from_slice(payload);
    if rumble && packet.len() > 2 {
        packet[2] |= 0x01;
    }
    packet
}

/// Payload of a memory write: `{addr:be32, size, data[16]}`.
pub fn write_memory(address: u32, data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() || data.len() > MAX_WRITE {
        return Err(BtError::argument(format!(
            "memory write of {} bytes",
            data.len()
        )));
    }
    let mut payload = Vec::with_capacity(5 + MAX_WRITE);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.push(data.len() as u8);
    payload.extend_from_slice(data);
    payload.resize(5 + MAX_WRITE, 0);
    Ok(payload)
}

/// Payload of a memory read: `{addr:be32, size:be16}`.
pub fn read_memory(address: u32, size: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&address.to_be_bytes());
    payload.extend_from_slice(&size.to_be_bytes());
    payload
}

/// Report 0x20: `BB BB LF 00 00 VV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusReport {
    pub buttons: u16,
    pub flags: u8,
    pub battery: u8,
}

impl StatusReport {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 6 {
            return None;
        }
        Some(Self {
            buttons: u16::from_be_bytes([body[0], body[1]]),
            flags: body[2],
            battery: body[5],
        })
    }

    pub fn extension_connected(&self) -> bool {
        self.flags & flags::EXTENSION_CONNECTED != 0
    }
}

/// Report 0x21: `BB BB SE AA AA DD*16`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadData {
    pub buttons: u16,
    /// Bytes in this chunk, 1..=16.
    pub size: usize,
    pub error: u8,
    /// Low 16 bits of the address of the first byte.
    pub address_low: u16,
    /// The carried bytes, at most 16.
    pub data: Vec<u8>,
}

impl ReadData {
    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 5 {
            return None;
        }
        let size = (body[2] >> 4) as usize + 1;
        let carried = &body[5..];
        Some(Self {
            buttons: u16::from_be_bytes([body[0], body[1]]),
            size,
            error: body[2] & 0x0F,
            address_low: u16::from_be_bytes([body[3], body[4]]),
            data: carried[..carried.len().min(size)].to_vec(),
        })
    }

    /// Whether this chunk answers a read at `address`.
    pub fn is_for(&self, address: u32) -> bool {
        self.address_low == (address & 0xFFFF) as u16
    }
}
