//! GATT protocol state machines.
//!
//! This module contains the two mirrored roles of the RadonEye protocol:
//! - the central reader ([`GattCentral`]) that discovers the radon service,
//!   triggers a measurement and reads it back
//! - the peripheral emulator ([`GattPeripheralEmulator`]) that plays the sensor

pub mod central;
pub mod events;
pub mod link;
pub mod peripheral;

pub use central::{CentralState, CentralTimings, ConnectionSession, CycleFailure, GattCentral};
pub use events::{
    CentralCommand, CentralEvent, CharacteristicDescriptor, ServiceDescriptor, SessionId,
    SettleStep, ATT_UNLIKELY_ERROR, GATT_STATUS_SUCCESS, INVALID_CONN_HANDLE,
};
pub use link::CentralLink;
pub use peripheral::{
    GattPeripheralEmulator, GattProfile, PeripheralCommand, PeripheralEvent, PeripheralState,
    RadonHandles, RandomValueSource, ValueSource,
};
