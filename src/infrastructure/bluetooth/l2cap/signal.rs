//! L2CAP signalling PDUs: `{code, id, length:le16, data}` on cid 0x0001.

use crate::error::{BtError, Result};

/// Channel id of the signalling channel.
pub const SIGNAL_CID: u16 = 0x0001;

/// Largest signal data block we build or answer with.
pub const MAX_SIGNAL_DATA: usize = 16;

/// Destination id placed in a refused Connection Response.
pub const REFUSED_DESTINATION_ID: u16 = 0x0040;

pub mod code {
    pub const REJECT: u8 = 0x01;
    pub const CONNECTION_REQUEST: u8 = 0x02;
    pub const CONNECTION_RESPONSE: u8 = 0x03;
    pub const CONFIGURE_REQUEST: u8 = 0x04;
    pub const CONFIGURE_RESPONSE: u8 = 0x05;
    pub const DISCONNECTION_REQUEST: u8 = 0x06;
    pub const DISCONNECTION_RESPONSE: u8 = 0x07;
    pub const ECHO_REQUEST: u8 = 0x08;
    pub const ECHO_RESPONSE: u8 = 0x09;
    pub const INFORMATION_REQUEST: u8 = 0x0A;
    pub const INFORMATION_RESPONSE: u8 = 0x0B;
}

/// Connection Response results.
pub mod result {
    pub const SUCCESS: u16 = 0x0000;
    pub const PENDING: u16 = 0x0001;
    pub const PSM_NOT_SUPPORTED: u16 = 0x0002;
}

/// Command Reject reason: command not understood.
pub const REJECT_NOT_UNDERSTOOD: u16 = 0x0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub code: u8,
    pub id: u8,
    pub data: Vec<u8>,
}

fn le16(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

impl Signal {
    pub fn new(code: u8, id: u8, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_SIGNAL_DATA {
            return Err(BtError::argument(format!(
                "signal {:#04x} carries {} data bytes, max {}",
                code,
                data.len(),
                MAX_SIGNAL_DATA
            )));
        }
        Ok(Self { code, id, data })
    }

    fn from_words(code: u8, id: u8, words: &[u16]) -> Self {
        let data = words.iter().flat_map(|w| le16(*w)).collect();
        Self { code, id, data }
    }

    pub fn connection_request(id: u8, psm: u16, source_id: u16) -> Self {
        Self::from_words(code::CONNECTION_REQUEST, id, &[psm, source_id])
    }

    pub fn connection_response(id: u8, destination_id: u16, source_id: u16, result: u16) -> Self {
        Self::from_words(
            code::CONNECTION_RESPONSE,
            id,
            &[destination_id, source_id, result, 0],
        )
    }

    /// Configuration Request for the peer's `destination_id`, no continuation.
    pub fn configure_request(id: u8, destination_id: u16, options: &[u8]) -> Result<Self> {
        let mut data = Self::from_words(code::CONFIGURE_REQUEST, id, &[destination_id, 0]).data;
        data.extend_from_slice(options);
        Self::new(code::CONFIGURE_REQUEST, id, data)
    }

    /// Successful Configuration Response echoing as many options as fit.
    pub fn configure_response(id: u8, source_id: u16, options: &[u8]) -> Self {
        let mut data = Self::from_words(code::CONFIGURE_RESPONSE, id, &[source_id, 0, result::SUCCESS]).data;
        let room = MAX_SIGNAL_DATA - data.len();
        data.extend_from_slice(&options[..options.len().min(room)]);
        Self {
            code: code::CONFIGURE_RESPONSE,
            id,
            data,
        }
    }

    pub fn disconnection_response(id: u8, destination_id: u16, source_id: u16) -> Self {
        Self::from_words(code::DISCONNECTION_RESPONSE, id, &[destination_id, source_id])
    }

    pub fn echo_response(id: u8, data: &[u8]) -> Self {
        Self {
            code: code::ECHO_RESPONSE,
            id,
            data: data[..data.len().min(MAX_SIGNAL_DATA)].to_vec(),
        }
    }

    pub fn information_response(id: u8, info_type: u16) -> Self {
        Self::from_words(code::INFORMATION_RESPONSE, id, &[info_type, result::SUCCESS])
    }

    pub fn command_reject(id: u8, reason: u16) -> Self {
        Self::from_words(code::REJECT, id, &[reason])
    }

    /// Little-endian word at byte `offset` of the data.
    pub fn word(&self, offset: usize) -> Option<u16> {
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.code);
        out.push(self.id);
        out.extend_from_slice(&le16(self.data.len() as u16));
        out.extend_from_slice(&self.data);
        out
    }

    /// Split a signalling packet into its commands.
    pub fn parse_all(packet: &[u8]) -> Result<Vec<Signal>> {
        let mut signals = Vec::new();
        let mut rest = packet;
        while !rest.is_empty() {
            if rest.len() < 4 {
                return Err(BtError::runtime(format!(
                    "signal header truncated ({} bytes)",
                    rest.len()
                )));
            }
            let length = u16::from_le_bytes([rest[2], rest[3]]) as usize;
            if rest.len() < 4 + length {
                return Err(BtError::runtime(format!(
                    "signal {:#04x} claims {} bytes, {} present",
                    rest[0],
                    length,
                    rest.len() - 4
                )));
            }
            signals.push(Signal {
                code: rest[0],
                id: rest[1],
                data: rest[4..4 + length].to_vec(),
            });
            rest = &rest[4 + length..];
        }
        Ok(signals)
    }
}
