//! Data report decoding.
//!
//! The receive path only copies report bytes into a [`RawState`]; `poll`
//! snapshots that under the session lock and runs [`decode`] on the copy.

use crate::domain::controller::{present, ControllerState, IrFormat};
use crate::domain::cursor::{IrDot, Point};
use crate::domain::extension::{ExtensionState, ExtensionType};
use crate::domain::imu::Calibration;
use crate::infrastructure::wiimote::protocol::{report, ir_format};
use std::ops::Range;

/// Two interleaved reports of 21 bytes.
pub const REPORT_BUFFER: usize = 42;

/// Offset of the second half of an interleaved pair.
const INTERLEAVED_B_OFFSET: usize = 21;

/// Coordinate of a dot the camera does not see.
const NO_DOT: u16 = 1023;

/// What the receive path has collected for one controller.
#[derive(Debug, Clone)]
pub struct RawState {
    /// Buttons from the last status report.
    pub core_buttons: u16,
    pub flags: u8,
    pub battery: u8,
    /// Id of the last data report, 0 before the first one.
    pub report_type: u8,
    pub report: [u8; REPORT_BUFFER],
    pub calibration: Calibration,
    pub extension: ExtensionType,
}

impl Default for RawState {
    fn default() -> Self {
        Self {
            core_buttons: 0,
            flags: 0,
            battery: 0,
            report_type: 0,
            report: [0; REPORT_BUFFER],
            calibration: Calibration::default(),
            extension: ExtensionType::None,
        }
    }
}

impl RawState {
    /// Store a data report. `0x3F` fills the second half of the buffer.
    pub fn store_report(&mut self, report_type: u8, body: &[u8]) {
        if report_type == report::INTERLEAVED_B {
            let n = body.len().min(REPORT_BUFFER - INTERLEAVED_B_OFFSET);
            self.report[INTERLEAVED_B_OFFSET..INTERLEAVED_B_OFFSET + n].copy_from_slice(&body[..n]);
        } else {
            let n = body.len().min(REPORT_BUFFER);
            self.report_type = report_type;
            self.report[..n].copy_from_slice(&body[..n]);
        }
    }
}

/// Parts of the state a data report carries.
pub fn present_mask(report_type: u8) -> u32 {
    use present::*;
    match report_type {
        report::BUTTONS => BUTTONS,
        report::BUTTONS_ACCEL => BUTTONS | ACCELEROMETER,
        report::BUTTONS_EXT8 => BUTTONS | EXTENSION,
        report::BUTTONS_ACCEL_IR12 => BUTTONS | ACCELEROMETER | IR,
        report::BUTTONS_EXT19 => BUTTONS | EXTENSION,
        report::BUTTONS_ACCEL_EXT16 => BUTTONS | ACCELEROMETER | EXTENSION,
        report::BUTTONS_IR10_EXT9 => BUTTONS | IR | EXTENSION,
        report::BUTTONS_ACCEL_IR10_EXT6 => BUTTONS | ACCELEROMETER | IR | EXTENSION,
        report::EXT21 => EXTENSION,
        report::INTERLEAVED_A | report::INTERLEAVED_B => BUTTONS | ACCELEROMETER | IR | INTERLACED,
        _ => 0,
    }
}

fn ir_bytes(report_type: u8) -> Option<Range<usize>> {
    match report_type {
        report::BUTTONS_ACCEL_IR12 => Some(5..17),
        report::BUTTONS_IR10_EXT9 => Some(2..12),
        report::BUTTONS_ACCEL_IR10_EXT6 => Some(5..15),
        report::INTERLEAVED_A | report::INTERLEAVED_B => Some(3..21),
        _ => None,
    }
}

fn extension_bytes(report_type: u8) -> Option<Range<usize>> {
    match report_type {
        report::BUTTONS_EXT8 => Some(2..10),
        report::BUTTONS_EXT19 => Some(2..21),
        report::BUTTONS_ACCEL_EXT16 => Some(5..21),
        report::BUTTONS_IR10_EXT9 => Some(12..21),
        report::BUTTONS_ACCEL_IR10_EXT6 => Some(15..21),
        report::EXT21 => Some(0..21),
        _ => None,
    }
}

/// Translate a raw snapshot into `state`.
///
/// Parts the report does not carry keep their previous values.
pub fn decode(raw: &RawState, state: &mut ControllerState, bar_offset: Point) {
    state.battery = raw.battery;
    if state.extension.kind != raw.extension {
        state.extension = ExtensionState::attached(raw.extension);
    }

    let mask = present_mask(raw.report_type);
    if mask == 0 {
        return;
    }
    state.present = mask;
    let r = &raw.report;

    if mask & present::BUTTONS != 0 {
        state.buttons.update(u16::from_le_bytes([r[0], r[1]]));
    }

    let has_accel = mask & present::ACCELEROMETER != 0;
    if has_accel {
        let sample = accelerometer_sample(r, mask & present::INTERLACED != 0);
        state.accelerometer.update(sample, &raw.calibration);
    }

    if mask & present::IR != 0 {
        if let Some(range) = ir_bytes(raw.report_type) {
            state.ir = match ir_format(raw.report_type) {
                IrFormat::Basic => decode_basic(&r[range]),
                IrFormat::Extended => decode_extended(&r[range]),
                IrFormat::Full => {
                    let b = range.start + INTERLEAVED_B_OFFSET..range.end + INTERLEAVED_B_OFFSET;
                    decode_full(&r[range], &r[b])
                }
            };
            let accelerometer = has_accel.then_some(&state.accelerometer);
            state.cursor.update(&mut state.ir, accelerometer, bar_offset);
        }
    }

    if mask & present::EXTENSION != 0 {
        if let Some(range) = extension_bytes(raw.report_type) {
            state.extension.update(&r[range]);
        }
    }
}

/// 10-bit samples. Interleaved pairs carry 8 bits per axis, with Z spread
/// over the spare button bits of both halves.
fn accelerometer_sample(r: &[u8; REPORT_BUFFER], interlaced: bool) -> [u16; 3] {
    let b = |i: usize| r[i] as u16;
    if interlaced {
        let z = ((b(0) >> 5) & 0b11) << 4
            | ((b(1) >> 5) & 0b11) << 6
            | ((b(21) >> 5) & 0b11)
            | ((b(22) >> 5) & 0b11) << 2;
        [b(2) << 2, b(23) << 2, z << 2]
    } else {
        [
            b(2) << 2 | (b(0) >> 5) & 0b11,
            b(3) << 2 | ((b(1) >> 5) & 0b1) << 1,
            b(4) << 2 | ((b(1) >> 6) & 0b1) << 1,
        ]
    }
}

fn dot(x: u16, y: u16) -> IrDot {
    IrDot {
        visible: true,
        pos: Point::new((NO_DOT - x) as i32, y as i32),
        ..Default::default()
    }
}

/// Five bytes per pair of dots, the middle byte holding the high bits.
fn decode_basic(bytes: &[u8]) -> [IrDot; 4] {
    let mut dots = [IrDot::default(); 4];
    for (pair, chunk) in bytes.chunks_exact(5).take(2).enumerate() {
        let hi = chunk[2] as u16;
        let points = [
            (chunk[0] as u16 | ((hi >> 4) & 0b11) << 8, chunk[1] as u16 | ((hi >> 6) & 0b11) << 8),
            (chunk[3] as u16 | (hi & 0b11) << 8, chunk[4] as u16 | ((hi >> 2) & 0b11) << 8),
        ];
        for (i, (x, y)) in points.into_iter().enumerate() {
            if x != NO_DOT || y != NO_DOT {
                dots[pair * 2 + i] = dot(x, y);
            }
        }
    }
    dots
}

fn extended_dot(b: &[u8]) -> Option<IrDot> {
    if b[..3].iter().all(|v| *v == 0xFF) {
        return None;
    }
    let x = b[0] as u16 | ((b[2] as u16 >> 4) & 0b11) << 8;
    let y = b[1] as u16 | ((b[2] as u16 >> 6) & 0b11) << 8;
    Some(IrDot {
        size: b[2] & 0x0F,
        ..dot(x, y)
    })
}

fn decode_extended(bytes: &[u8]) -> [IrDot; 4] {
    let mut dots = [IrDot::default(); 4];
    for (i, chunk) in bytes.chunks_exact(3).take(4).enumerate() {
        if let Some(d) = extended_dot(chunk) {
            dots[i] = d;
        }
    }
    dots
}

/// Nine bytes per dot: extended form, bounding box, intensity. Dots 0-1
/// come from the first report of the pair, 2-3 from the second.
fn decode_full(first: &[u8], second: &[u8]) -> [IrDot; 4] {
    let mut dots = [IrDot::default(); 4];
    let chunks = first.chunks_exact(9).take(2).chain(second.chunks_exact(9).take(2));
    for (i, b) in chunks.enumerate() {
        if let Some(d) = extended_dot(b) {
            dots[i] = IrDot {
                bbox: (
                    Point::new((b[3] & 0x7F) as i32, (b[4] & 0x7F) as i32),
                    Point::new((b[5] & 0x7F) as i32, (b[6] & 0x7F) as i32),
                ),
                intensity: b[8],
                ..d
            };
        }
    }
    dots
}
