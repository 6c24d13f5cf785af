//! HCI Protocol
//!
//! Opcodes, event codes and the wire layouts of the HCI commands, events and
//! ACL headers the stack uses. All multi-byte fields are little-endian.

use crate::domain::models::{BdAddr, DiscoveredDevice};
use crate::error::{BtError, Result};

/// Largest parameter block a command may carry.
pub const MAX_COMMAND_PARAMS: usize = 64;

/// Largest ACL payload the stack is built to handle.
pub const MAX_ACL_PACKET_LENGTH: usize = 512;

/// Size of an HCI event buffer: code, length and up to 255 parameter bytes.
pub const EVENT_BUFFER_SIZE: usize = 257;

/// Size of the name field in Remote Name Request Complete, NUL padded.
/// A name filling the whole field has no terminator.
pub const MAX_REMOTE_NAME_LENGTH: usize = 248;

/// General/Unlimited Inquiry Access Code.
pub const GIAC_LAP: u32 = 0x9E8B33;

/// Disconnect reason: remote user terminated connection.
pub const REASON_USER_TERMINATED: u8 = 0x13;

/// Reject reason: connection rejected due to unacceptable BD_ADDR.
pub const REASON_UNACCEPTABLE_BD_ADDR: u8 = 0x0F;

/// Command opcodes (OGF << 10 | OCF).
pub mod opcode {
    pub const INQUIRY: u16 = 0x0401;
    pub const INQUIRY_CANCEL: u16 = 0x0402;
    pub const CREATE_CONNECTION: u16 = 0x0405;
    pub const DISCONNECT: u16 = 0x0406;
    pub const ACCEPT_CONNECTION_REQUEST: u16 = 0x0409;
    pub const REJECT_CONNECTION_REQUEST: u16 = 0x040A;
    pub const REMOTE_NAME_REQUEST: u16 = 0x0419;

    pub const SET_EVENT_MASK: u16 = 0x0C01;
    pub const RESET: u16 = 0x0C03;
    pub const WRITE_SCAN_ENABLE: u16 = 0x0C1A;

    pub const READ_LOCAL_VERSION: u16 = 0x1001;
    pub const READ_LOCAL_FEATURES: u16 = 0x1003;
    pub const READ_BUFFER_SIZE: u16 = 0x1005;
    pub const READ_BD_ADDR: u16 = 0x1009;
}

/// Event codes.
pub mod event {
    pub const INQUIRY_COMPLETE: u8 = 0x01;
    pub const INQUIRY_RESULT: u8 = 0x02;
    pub const CONNECTION_COMPLETE: u8 = 0x03;
    pub const CONNECTION_REQUEST: u8 = 0x04;
    pub const DISCONNECTION_COMPLETE: u8 = 0x05;
    pub const REMOTE_NAME_REQUEST_COMPLETE: u8 = 0x07;
    pub const COMMAND_COMPLETE: u8 = 0x0E;
    pub const COMMAND_STATUS: u8 = 0x0F;
    pub const HARDWARE_ERROR: u8 = 0x10;
    pub const NUMBER_OF_COMPLETED_PACKETS: u8 = 0x13;
}

/// Events the stack asks the controller to deliver.
pub const EVENT_MASK: u64 = (1 << 0) // Inquiry Complete
    | (1 << 1) // Inquiry Result
    | (1 << 2) // Connection Complete
    | (1 << 3) // Connection Request
    | (1 << 4); // Disconnection Complete

/// Commands issued, in order, right after the reset during initialization.
pub const INIT_SEQUENCE: &[u16] = &[
    opcode::READ_LOCAL_VERSION,
    opcode::READ_LOCAL_FEATURES,
    opcode::READ_BD_ADDR,
    opcode::READ_BUFFER_SIZE,
];

/// Assemble a command packet: `{opcode:le16, param_len:u8, params}`.
pub fn encode_command(opcode: u16, params: &[u8]) -> Result<Vec<u8>> {
    if params.len() > MAX_COMMAND_PARAMS {
        return Err(BtError::argument(format!(
            "command {:#06x} parameters too long: {} > {}",
            opcode,
            params.len(),
            MAX_COMMAND_PARAMS
        )));
    }

    let mut packet = Vec::with_capacity(3 + params.len());
    packet.extend_from_slice(&opcode.to_le_bytes());
    packet.push(params.len() as u8);
    packet.extend_from_slice(params);
    Ok(packet)
}

/// An event as received from the interrupt endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Event<'a> {
    pub code: u8,
    pub params: &'a [u8],
}

impl<'a> Event<'a> {
    /// Split a raw event buffer into code and parameters.
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < 2 {
            return Err(BtError::runtime(format!(
                "event of {} bytes has no header",
                buffer.len()
            )));
        }
        let length = buffer[1] as usize;
        if buffer.len() < 2 + length {
            return Err(BtError::runtime(format!(
                "event {:#04x} claims {} parameter bytes, got {}",
                buffer[0],
                length,
                buffer.len() - 2
            )));
        }
        Ok(Self {
            code: buffer[0],
            params: &buffer[2..2 + length],
        })
    }
}

fn require(params: &[u8], len: usize, what: &str) -> Result<()> {
    if params.len() < len {
        return Err(BtError::runtime(format!(
            "{} too short: {} < {}",
            what,
            params.len(),
            len
        )));
    }
    Ok(())
}

fn le16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

/// Command Complete: `{num_packets, opcode:le16, return parameters…}`.
pub fn parse_command_complete(params: &[u8]) -> Result<(u16, &[u8])> {
    require(params, 3, "command complete")?;
    Ok((le16(params, 1), &params[3..]))
}

/// Command Status: `{status, num_packets, opcode:le16}`.
pub fn parse_command_status(params: &[u8]) -> Result<(u16, u8)> {
    require(params, 4, "command status")?;
    Ok((le16(params, 2), params[0]))
}

/// Size of one Inquiry Result record.
pub const INQUIRY_RECORD_SIZE: usize = 14;

/// Inquiry Result: `{count, count × {addr[6], psrm, reserved[2], cod:le24, clock_offset:le16}}`.
pub fn parse_inquiry_results(params: &[u8]) -> Result<Vec<DiscoveredDevice>> {
    require(params, 1, "inquiry result")?;
    let count = params[0] as usize;
    require(params, 1 + count * INQUIRY_RECORD_SIZE, "inquiry result records")?;

    Ok(params[1..1 + count * INQUIRY_RECORD_SIZE]
        .chunks_exact(INQUIRY_RECORD_SIZE)
        .map(|record| DiscoveredDevice {
            address: BdAddr::from_wire(&record[0..6]),
            page_scan_repetition_mode: record[6],
            class_of_device: u32::from_le_bytes([record[9], record[10], record[11], 0]),
            clock_offset: le16(record, 12),
            connection_request: false,
        })
        .collect())
}

/// Connection Request: `{addr[6], cod:le24, link_type}`.
pub fn parse_connection_request(params: &[u8]) -> Result<(DiscoveredDevice, u8)> {
    require(params, 10, "connection request")?;
    let device = DiscoveredDevice {
        address: BdAddr::from_wire(&params[0..6]),
        page_scan_repetition_mode: 0x01,
        class_of_device: u32::from_le_bytes([params[6], params[7], params[8], 0]),
        clock_offset: 0,
        connection_request: true,
    };
    Ok((device, params[9]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionComplete {
    pub status: u8,
    pub handle: u16,
    pub address: BdAddr,
    pub link_type: u8,
    pub encryption_enabled: bool,
}

pub fn parse_connection_complete(params: &[u8]) -> Result<ConnectionComplete> {
    require(params, 11, "connection complete")?;
    Ok(ConnectionComplete {
        status: params[0],
        handle: le16(params, 1) & 0x0FFF,
        address: BdAddr::from_wire(&params[3..9]),
        link_type: params[9],
        encryption_enabled: params[10] != 0,
    })
}

/// Disconnection Complete: `{status, handle:le16, reason}`.
pub fn parse_disconnection_complete(params: &[u8]) -> Result<(u8, u16, u8)> {
    require(params, 4, "disconnection complete")?;
    Ok((params[0], le16(params, 1) & 0x0FFF, params[3]))
}

/// Remote Name Request Complete: `{status, addr[6], name[248]}`.
///
/// The name stops at the first NUL and is decoded lossily.
pub fn parse_remote_name(params: &[u8]) -> Result<(u8, BdAddr, String)> {
    require(params, 7, "remote name complete")?;
    let raw = &params[7..params.len().min(7 + MAX_REMOTE_NAME_LENGTH)];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    Ok((
        params[0],
        BdAddr::from_wire(&params[1..7]),
        String::from_utf8_lossy(&raw[..end]).into_owned(),
    ))
}

/// Number Of Completed Packets: `{count, handles[count]:le16, completed[count]:le16}`.
pub fn parse_completed_packets(params: &[u8]) -> Result<Vec<(u16, u16)>> {
    require(params, 1, "completed packets")?;
    let count = params[0] as usize;
    require(params, 1 + count * 4, "completed packets entries")?;

    let counts_at = 1 + count * 2;
    Ok((0..count)
        .map(|i| {
            let handle = le16(params, 1 + i * 2) & 0x0FFF;
            let completed = le16(params, counts_at + i * 2);
            (handle, completed)
        })
        .collect())
}

/// Read Local Version Information return parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalVersion {
    pub hci_version: u8,
    pub hci_revision: u16,
    pub lmp_version: u8,
    pub manufacturer: u16,
    pub lmp_subversion: u16,
}

pub fn parse_local_version(reply: &[u8]) -> Result<LocalVersion> {
    require(reply, 9, "local version reply")?;
    Ok(LocalVersion {
        hci_version: reply[1],
        hci_revision: le16(reply, 2),
        lmp_version: reply[4],
        manufacturer: le16(reply, 5),
        lmp_subversion: le16(reply, 7),
    })
}

pub fn parse_local_features(reply: &[u8]) -> Result<[u8; 8]> {
    require(reply, 9, "local features reply")?;
    let mut features = [0u8; 8];
    features.copy_from_slice(&reply[1..9]);
    Ok(features)
}

pub fn parse_bd_addr(reply: &[u8]) -> Result<BdAddr> {
    require(reply, 7, "bd_addr reply")?;
    Ok(BdAddr::from_wire(&reply[1..7]))
}

/// Read Buffer Size return parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferSize {
    pub acl_max_packet_length: u16,
    pub sco_max_packet_length: u8,
    pub acl_max_packets: u16,
    pub sco_max_packets: u16,
}

pub fn parse_buffer_size(reply: &[u8]) -> Result<BufferSize> {
    require(reply, 8, "buffer size reply")?;
    Ok(BufferSize {
        acl_max_packet_length: le16(reply, 1),
        sco_max_packet_length: reply[3],
        acl_max_packets: le16(reply, 4),
        sco_max_packets: le16(reply, 6),
    })
}

/// Packet types to offer in Create Connection, from the local feature mask.
pub fn packet_types(features: &[u8; 8]) -> u16 {
    // DM1 and DH1 are mandatory
    let mut types: u16 = 0x0008 | 0x0010;

    if features[0] & (1 << 0) != 0 {
        types |= 0x0400 | 0x0800; // DM3, DH3
    }
    if features[0] & (1 << 1) != 0 {
        types |= 0x4000 | 0x8000; // DM5, DH5
    }

    // EDR bits have inverted meaning: set means "may not be used"
    if features[3] & (1 << 1) == 0 {
        types |= 0x0002 | 0x0100 | 0x1000; // 2-DHx
    }
    if features[3] & (1 << 2) == 0 {
        types |= 0x0004 | 0x0200 | 0x2000; // 3-DHx
    }
    if features[4] & (1 << 7) == 0 {
        types |= 0x0100 | 0x0200; // 3-slot EDR
    }
    if features[5] & (1 << 0) == 0 {
        types |= 0x1000 | 0x2000; // 5-slot EDR
    }
    types
}

/// ACL packet boundary flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketBoundary {
    FirstNonFlushable = 0,
    Continuing = 1,
    FirstAutoFlushable = 2,
    Complete = 3,
}

impl PacketBoundary {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::FirstNonFlushable,
            1 => Self::Continuing,
            2 => Self::FirstAutoFlushable,
            _ => Self::Complete,
        }
    }
}

/// ACL broadcast flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFlag {
    PointToPoint = 0,
    Active = 1,
    Parked = 2,
    Reserved = 3,
}

impl BroadcastFlag {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::PointToPoint,
            1 => Self::Active,
            2 => Self::Parked,
            _ => Self::Reserved,
        }
    }
}

/// `{handle:12 | pb:2 | bc:2, length:le16}`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclHeader {
    pub handle: u16,
    pub pb: PacketBoundary,
    pub bc: BroadcastFlag,
    pub length: u16,
}

impl AclHeader {
    pub const SIZE: usize = 4;

    pub fn to_bytes(&self) -> [u8; 4] {
        let word = (self.handle & 0x0FFF) | ((self.pb as u16) << 12) | ((self.bc as u16) << 14);
        let w = word.to_le_bytes();
        let l = self.length.to_le_bytes();
        [w[0], w[1], l[0], l[1]]
    }

    /// Decode a received ACL packet header, checking the payload is present.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        require(buffer, Self::SIZE, "acl packet")?;
        let word = le16(buffer, 0);
        let header = Self {
            handle: word & 0x0FFF,
            pb: PacketBoundary::from_bits((word >> 12) as u8),
            bc: BroadcastFlag::from_bits((word >> 14) as u8),
            length: le16(buffer, 2),
        };
        if buffer.len() < Self::SIZE + header.length as usize {
            return Err(BtError::runtime(format!(
                "acl packet claims {} bytes, got {}",
                header.length,
                buffer.len() - Self::SIZE
            )));
        }
        Ok(header)
    }
}
