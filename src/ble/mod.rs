//! BLE communication module.
//!
//! This module provides the Bluetooth Low Energy building blocks: address
//! and advertisement codecs, the GATT UUIDs of the sensor, the btleplug
//! backed [`CentralLink`](crate::gatt::CentralLink), and a debug scanner.

pub mod address;
pub mod advertising;
pub mod btleplug_link;
pub mod scanner;
pub mod uuids;

pub use address::{AddressType, BdAddress};
pub use advertising::DeviceName;
pub use btleplug_link::BtleplugLink;
pub use scanner::{BleScanner, ScanLog, Sighting};
pub use uuids::*;
