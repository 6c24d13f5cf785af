//! System Controller Settings
//!
//! Reads the controller records kept in the system configuration store:
//! sensor bar placement, motor enable, IR sensitivity, speaker volume and
//! the guest and registered controller rosters. The store is read-only
//! from this crate's point of view.

use crate::domain::cursor::{Point, SENSOR_BAR_OFFSET};
use crate::domain::models::BdAddr;
use crate::error::{BtError, Result};
use anyhow::Context;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, error};

/// Key/value source of raw configuration records.
pub trait ConfigStore: Send + Sync {
    /// Copy the record for `key` into `out`. Returns the record's size,
    /// or 0 when it does not exist.
    fn get(&self, key: &str, out: &mut [u8]) -> usize;
}

pub mod key {
    pub const SENSOR_BAR: &str = "BT.BAR";
    pub const GUESTS: &str = "BT.CDIF";
    pub const REGISTERED: &str = "BT.DINF";
    pub const MOTOR: &str = "BT.MOT";
    pub const SENSITIVITY: &str = "BT.SENS";
    pub const SPEAKER_VOLUME: &str = "BT.SPKV";
}

pub const MAX_GUESTS: usize = 6;
pub const MAX_REGISTERED: usize = 10;
pub const MAX_ACTIVE: usize = 6;

const NAME_LENGTH: usize = 64;
const LINK_KEY_LENGTH: usize = 16;
const GUEST_ENTRY: usize = 6 + NAME_LENGTH + LINK_KEY_LENGTH;
const DEVICE_ENTRY: usize = 6 + NAME_LENGTH;

/// Size of the `BT.CDIF` record.
pub const GUESTS_SIZE: usize = 1 + MAX_GUESTS * GUEST_ENTRY;
/// Size of the `BT.DINF` record.
pub const REGISTERED_SIZE: usize = 1 + MAX_REGISTERED * DEVICE_ENTRY + MAX_ACTIVE * DEVICE_ENTRY;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SensorBarPosition {
    #[default]
    Bottom,
    Top,
}

impl SensorBarPosition {
    /// Shift applied to the IR centroid before it is mapped to the screen.
    pub fn cursor_offset(self) -> Point {
        match self {
            Self::Bottom => Point::new(0, -SENSOR_BAR_OFFSET),
            Self::Top => Point::new(0, SENSOR_BAR_OFFSET),
        }
    }
}

/// A controller paired with the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairedDevice {
    pub mac: BdAddr,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestDevice {
    pub mac: BdAddr,
    pub name: String,
    pub link_key: [u8; LINK_KEY_LENGTH],
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WiimoteSysConfig {
    pub sensor_bar: SensorBarPosition,
    pub motor_enabled: bool,
    pub ir_sensitivity: u32,
    pub speaker_volume: u8,
    pub guests: Vec<GuestDevice>,
    pub registered: Vec<PairedDevice>,
    pub active: Vec<PairedDevice>,
}

fn read_exact(store: &dyn ConfigStore, key: &str, out: &mut [u8]) -> Result<()> {
    let length = store.get(key, out);
    if length != out.len() {
        return Err(BtError::runtime(format!(
            "setting \"{}\" has length {}, expected {}",
            key,
            length,
            out.len()
        )));
    }
    Ok(())
}

/// Stored MACs are little-endian.
fn mac(bytes: &[u8]) -> BdAddr {
    BdAddr::from_wire(&bytes[..6])
}

fn name(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn device(entry: &[u8]) -> PairedDevice {
    PairedDevice {
        mac: mac(entry),
        name: name(&entry[6..6 + NAME_LENGTH]),
    }
}

impl WiimoteSysConfig {
    /// Load every record, falling back to defaults if any is malformed.
    pub fn load(store: &dyn ConfigStore) -> Self {
        match Self::try_load(store) {
            Ok(config) => {
                config.log();
                config
            }
            Err(e) => {
                error!(target: "settings", "Failed to parse controller settings: {}. Using defaults.", e);
                Self::default()
            }
        }
    }

    pub fn try_load(store: &dyn ConfigStore) -> Result<Self> {
        let mut byte = [0u8; 1];
        read_exact(store, key::SENSOR_BAR, &mut byte)?;
        let sensor_bar = if byte[0] != 0 {
            SensorBarPosition::Top
        } else {
            SensorBarPosition::Bottom
        };

        let mut guests_block = vec![0u8; GUESTS_SIZE];
        read_exact(store, key::GUESTS, &mut guests_block)?;
        let mut registered_block = vec![0u8; REGISTERED_SIZE];
        read_exact(store, key::REGISTERED, &mut registered_block)?;

        read_exact(store, key::MOTOR, &mut byte)?;
        let motor_enabled = byte[0] != 0;

        let mut word = [0u8; 4];
        read_exact(store, key::SENSITIVITY, &mut word)?;
        let ir_sensitivity = u32::from_be_bytes(word);

        read_exact(store, key::SPEAKER_VOLUME, &mut byte)?;
        let speaker_volume = byte[0];

        let guest_count = guests_block[0] as usize;
        if guest_count > MAX_GUESTS {
            return Err(BtError::runtime(format!("{} guest controllers", guest_count)));
        }
        let registered_count = registered_block[0] as usize;
        if registered_count > MAX_REGISTERED {
            return Err(BtError::runtime(format!(
                "{} registered controllers",
                registered_count
            )));
        }

        let guests = guests_block[1..]
            .chunks_exact(GUEST_ENTRY)
            .take(guest_count)
            .map(|entry| {
                let mut link_key = [0u8; LINK_KEY_LENGTH];
                link_key.copy_from_slice(&entry[6 + NAME_LENGTH..]);
                GuestDevice {
                    mac: mac(entry),
                    name: name(&entry[6..6 + NAME_LENGTH]),
                    link_key,
                }
            })
            .collect();

        let (registered_entries, active_entries) =
            registered_block[1..].split_at(MAX_REGISTERED * DEVICE_ENTRY);
        let registered = registered_entries
            .chunks_exact(DEVICE_ENTRY)
            .take(registered_count)
            .map(device)
            .collect();
        let active = active_entries
            .chunks_exact(DEVICE_ENTRY)
            .map(device)
            .filter(|d| !d.mac.is_zero())
            .collect();

        Ok(Self {
            sensor_bar,
            motor_enabled,
            ir_sensitivity,
            speaker_volume,
            guests,
            registered,
            active,
        })
    }

    fn log(&self) {
        debug!(target: "settings", "Controller settings:");
        debug!(target: "settings", "  Sensor bar:     {:?}", self.sensor_bar);
        debug!(target: "settings", "  Motor enabled:  {}", self.motor_enabled);
        debug!(target: "settings", "  IR sensitivity: {}", self.ir_sensitivity);
        debug!(target: "settings", "  Speaker volume: {}", self.speaker_volume);
        debug!(target: "settings", "  Guests ({}):", self.guests.len());
        for guest in &self.guests {
            debug!(target: "settings", "    {} {}", guest.mac, guest.name);
        }
        debug!(target: "settings", "  Registered ({}):", self.registered.len());
        for device in &self.registered {
            debug!(target: "settings", "    {} {}", device.mac, device.name);
        }
    }

    pub fn is_registered(&self, mac: BdAddr) -> bool {
        self.registered.iter().any(|d| d.mac == mac) || self.guests.iter().any(|d| d.mac == mac)
    }
}

/// Configuration store kept in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    records: HashMap<String, Vec<u8>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: Vec<u8>) {
        self.records.insert(key.to_string(), value);
    }
}

fn copy_record(records: &HashMap<String, Vec<u8>>, key: &str, out: &mut [u8]) -> usize {
    match records.get(key) {
        Some(value) => {
            let n = value.len().min(out.len());
            out[..n].copy_from_slice(&value[..n]);
            value.len()
        }
        None => 0,
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str, out: &mut [u8]) -> usize {
        copy_record(&self.records, key, out)
    }
}

/// Configuration store loaded from a JSON object of byte arrays,
/// e.g. `{"BT.BAR": [1], "BT.SENS": [0, 0, 0, 3]}`.
#[derive(Debug, Clone, Default)]
pub struct JsonConfigStore {
    records: HashMap<String, Vec<u8>>,
}

impl JsonConfigStore {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config store {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        let records = serde_json::from_str(content).context("parsing config store")?;
        Ok(Self { records })
    }
}

impl ConfigStore for JsonConfigStore {
    fn get(&self, key: &str, out: &mut [u8]) -> usize {
        copy_record(&self.records, key, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(mac_wire: [u8; 6], name: &str, size: usize) -> Vec<u8> {
        let mut out = mac_wire.to_vec();
        let mut padded = name.as_bytes().to_vec();
        padded.resize(NAME_LENGTH, 0);
        out.extend(padded);
        out.resize(size, 0xAB);
        out
    }

    fn store() -> MemoryConfigStore {
        let mut store = MemoryConfigStore::new();
        store.set(key::SENSOR_BAR, vec![1]);
        store.set(key::MOTOR, vec![1]);
        store.set(key::SENSITIVITY, vec![0, 0, 0, 3]);
        store.set(key::SPEAKER_VOLUME, vec![0x58]);

        let mut guests = vec![1];
        guests.extend(entry([6, 5, 4, 3, 2, 1], "Nintendo RVL-CNT-01", GUEST_ENTRY));
        guests.resize(GUESTS_SIZE, 0);
        store.set(key::GUESTS, guests);

        let mut registered = vec![2];
        registered.extend(entry([0x66, 0x55, 0x44, 0x33, 0x22, 0x11], "Nintendo RVL-CNT-01", DEVICE_ENTRY));
        registered.extend(entry([0x16, 0x15, 0x14, 0x13, 0x12, 0x11], "Nintendo RVL-CNT-01-TR", DEVICE_ENTRY));
        registered.resize(REGISTERED_SIZE, 0);
        store.set(key::REGISTERED, registered);
        store
    }

    #[test]
    fn test_record_sizes() {
        assert_eq!(GUESTS_SIZE, 517);
        assert_eq!(REGISTERED_SIZE, 1121);
    }

    #[test]
    fn test_load() {
        let config = WiimoteSysConfig::try_load(&store()).unwrap();
        assert_eq!(config.sensor_bar, SensorBarPosition::Top);
        assert!(config.motor_enabled);
        assert_eq!(config.ir_sensitivity, 3);
        assert_eq!(config.speaker_volume, 0x58);

        assert_eq!(config.guests.len(), 1);
        assert_eq!(config.guests[0].mac, BdAddr::new([1, 2, 3, 4, 5, 6]));
        assert_eq!(config.guests[0].link_key, [0xAB; 16]);

        assert_eq!(config.registered.len(), 2);
        assert_eq!(
            config.registered[0].mac,
            BdAddr::new([0x11, 0x22, 0x33, 0x44, 0x55, 0x66])
        );
        assert_eq!(config.registered[1].name, "Nintendo RVL-CNT-01-TR");
        assert!(config.active.is_empty());
        assert!(config.is_registered(BdAddr::new([1, 2, 3, 4, 5, 6])));
    }

    #[test]
    fn test_wrong_size_reverts_to_defaults() {
        let mut store = store();
        store.set(key::SENSITIVITY, vec![3]);
        assert!(WiimoteSysConfig::try_load(&store).is_err());
        assert_eq!(WiimoteSysConfig::load(&store), WiimoteSysConfig::default());

        let mut store = self::store();
        store.records.remove(key::MOTOR);
        assert_eq!(WiimoteSysConfig::load(&store), WiimoteSysConfig::default());
    }

    #[test]
    fn test_roster_limits() {
        let mut store = store();
        let mut guests = vec![7];
        guests.resize(GUESTS_SIZE, 0);
        store.set(key::GUESTS, guests);
        assert!(WiimoteSysConfig::try_load(&store).is_err());

        let mut store = self::store();
        let mut registered = vec![11];
        registered.resize(REGISTERED_SIZE, 0);
        store.set(key::REGISTERED, registered);
        assert!(WiimoteSysConfig::try_load(&store).is_err());
    }

    #[test]
    fn test_json_store() {
        let store = JsonConfigStore::from_json(r#"{"BT.BAR": [1], "BT.SENS": [0, 0, 0, 4]}"#).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(store.get(key::SENSITIVITY, &mut out), 4);
        assert_eq!(u32::from_be_bytes(out), 4);
        assert_eq!(store.get(key::MOTOR, &mut out), 0);
        assert!(JsonConfigStore::from_json("[1, 2]").is_err());
    }

    #[test]
    fn test_bar_offset() {
        assert_eq!(SensorBarPosition::Bottom.cursor_offset(), Point::new(0, -140));
        assert_eq!(SensorBarPosition::Top.cursor_offset(), Point::new(0, 140));
    }
}
