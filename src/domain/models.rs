use serde::{Deserialize, Serialize};
use std::fmt;

/// Bluetooth device address, kept in display order (`AA:BB:CC:DD:EE:FF`).
///
/// HCI carries addresses little-endian; use [`BdAddr::from_wire`] and
/// [`BdAddr::to_wire`] at the protocol boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BdAddr(pub [u8; 6]);

impl BdAddr {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build from the little-endian byte order used on the wire.
    pub fn from_wire(bytes: &[u8]) -> Self {
        let mut out = [0u8; 6];
        for (i, b) in bytes.iter().take(6).enumerate() {
            out[5 - i] = *b;
        }
        Self(out)
    }

    pub fn to_wire(&self) -> [u8; 6] {
        let mut out = self.0;
        out.reverse();
        out
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// A device seen by an inquiry, or one asking us to connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub address: BdAddr,
    pub page_scan_repetition_mode: u8,
    /// 24-bit class of device.
    pub class_of_device: u32,
    pub clock_offset: u16,
    /// True when this came from a Connection Request event rather than an
    /// inquiry result.
    pub connection_request: bool,
}

impl DiscoveredDevice {
    /// Description for a device we only know by address, e.g. a paired
    /// controller loaded from the configuration store.
    pub fn from_address(address: BdAddr) -> Self {
        Self {
            address,
            // R1, the usual "safe" value
            page_scan_repetition_mode: 0x01,
            class_of_device: 0,
            clock_offset: 0,
            connection_request: false,
        }
    }
}

/// Connection state of a controller slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_order_is_reversed() {
        let addr = BdAddr::from_wire(&[0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
        assert_eq!(addr, BdAddr::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
        assert_eq!(addr.to_wire(), [0xFF, 0xEE, 0xDD, 0xCC, 0xBB, 0xAA]);
    }

    #[test]
    fn test_display() {
        let addr = BdAddr::new([0x00, 0x1f, 0x32, 0xab, 0x0c, 0x01]);
        assert_eq!(addr.to_string(), "00:1F:32:AB:0C:01");
    }

    #[test]
    fn test_from_address_defaults() {
        let device = DiscoveredDevice::from_address(BdAddr::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(device.page_scan_repetition_mode, 0x01);
        assert!(!device.connection_request);
    }
}
