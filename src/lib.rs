// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]
#![warn(missing_docs)]

//! # radoneye-ble
//!
//! Periodic Bluetooth Low Energy readout of RadonEye radon sensors, with
//! forwarding of each reading to a HomeMatic CCU, plus an emulator that
//! plays the sensor side of the protocol.
//!
//! ## Features
//!
//! - **Reader**: connect, discover the radon service, trigger a measurement,
//!   read the calibrated value and disconnect, once per readout interval
//! - **Watchdog**: every connection is closed after a bounded time, whatever
//!   the sensor does
//! - **Forwarding**: HTTP GET against a URL template (`{radon}`, `{ise_id}`)
//! - **Emulator**: sans-IO peripheral state machine answering trigger writes
//!   with simulated readings
//! - **Loopback**: run a complete cycle against the emulator without hardware
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use radoneye_ble::{
//!     event_channel, AddressType, BdAddress, BtleplugLink, HomematicSink, RadonReader, Result,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let sensor: BdAddress = "AA:BB:CC:DD:EE:FF".parse()?;
//!     let (tx, rx) = event_channel();
//!     let link = Arc::new(BtleplugLink::new(tx.clone()).await?);
//!     let sink = Arc::new(HomematicSink::new(
//!         "http://ccu/addons/xmlapi/statechange.cgi?ise_id={ise_id}&new_value={radon}",
//!         "4711",
//!     )?);
//!
//!     let mut reader = RadonReader::new(link, sink, (tx, rx), sensor, AddressType::Random);
//!     let report = reader.run_cycle().await?;
//!
//!     if let Some(reading) = report.reading {
//!         println!("Radon: {}", reading);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### macOS
//! Requires Bluetooth permission. Devices are identified by platform UUIDs,
//! so address lookup only works on platforms that expose MAC addresses.

// Public modules
pub mod ble;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod forward;
pub mod gatt;
pub mod protocol;
pub mod reader;
pub mod sim;
pub mod watchdog;

// Re-exports for convenience
pub use ble::{AddressType, BdAddress, BleScanner, BtleplugLink};
pub use config::{NetworkCredentials, ReaderConfig};
pub use connectivity::{AlwaysOnline, ConnectivityProvider, TcpReachability};
pub use error::{Error, Result};
pub use forward::{ForwardingSink, HomematicSink, LogSink};
pub use gatt::{
    CentralCommand, CentralEvent, CentralLink, CentralState, CentralTimings, CycleFailure,
    GattCentral, GattPeripheralEmulator, PeripheralCommand, PeripheralEvent,
};
pub use protocol::SensorReading;
pub use reader::{event_channel, CycleReport, RadonReader, ReaderStatus};
pub use sim::{LoopbackFaults, LoopbackLink};
pub use watchdog::ConnectionWatchdog;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<GattCentral>();
        let _ = std::any::TypeId::of::<GattPeripheralEmulator>();
        let _ = std::any::TypeId::of::<ConnectionWatchdog>();
        let _ = std::any::TypeId::of::<SensorReading>();
        let _ = std::any::TypeId::of::<ReaderConfig>();
        let _ = std::any::TypeId::of::<LoopbackLink>();
        let _ = std::any::TypeId::of::<Error>();
    }
}
