//! Bluetooth HID input stack for a USB HCI dongle.
//!
//! [`BluetoothStack`] wires the layers together: the HCI driver talks to the
//! dongle, L2CAP multiplexes channels over its ACL links, and the driver
//! registry hands discovered or paired devices to controller drivers. The
//! Wiimote driver decodes its reports into [`ControllerState`].

pub mod domain;
pub mod error;
pub mod infrastructure;

#[cfg(test)]
mod testing;

pub use domain::controller::ControllerState;
pub use domain::settings::{Settings, SettingsService};
pub use error::{BtError, Result};
pub use infrastructure::logging::init_logger;
pub use infrastructure::stack::BluetoothStack;
