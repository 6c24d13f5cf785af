//! Bluetooth Module
//!
//! Host side of a Bluetooth Classic stack driving a USB HCI dongle.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    DriverRegistry                        │
//! │  (discovery, connection requests, controller drivers)    │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │   L2CAP    │  │ Protocol │
//! │           │  │            │  │          │
//! │ - inquiry │  │ - channels │  │ - opcodes│
//! │   budget  │  │ - signals  │  │ - events │
//! └───────────┘  └─────┬──────┘  └──────────┘
//!                      │
//!                      ▼
//!               ┌────────────┐
//!               │    HCI     │
//!               │ - commands │
//!               │ - ACL data │
//!               └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - HCI opcodes, events and packet layouts
//! - [`hci`] - Command/event exchange and ACL transport
//! - [`l2cap`] - Channel multiplexing over ACL links
//! - [`scanner`] - Automatic discovery time budget
//! - [`service`] - Driver registry and worker

pub mod hci;
pub mod l2cap;
pub mod protocol;
pub mod scanner;
pub mod service;

pub use hci::{Hci, HciConfig};
pub use l2cap::{L2cap, L2capConfig};
pub use service::{BluetoothDriver, DriverRegistry};
