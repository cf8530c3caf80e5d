//! Radio events and requests exchanged with the central state machine.
//!
//! The radio stack reports everything asynchronously: each result of a
//! request comes back as one [`CentralEvent`], delivered serially on a single
//! channel. Timer expirations travel on the same channel.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddress};
use crate::protocol::SensorReading;

/// Connection handle reported by the controller for a failed connection attempt.
pub const INVALID_CONN_HANDLE: u16 = 0xFFFF;

/// ATT status for a successful write.
pub const GATT_STATUS_SUCCESS: u16 = 0x0000;

/// ATT status reported when the radio stack failed a request without a peer status.
pub const ATT_UNLIKELY_ERROR: u16 = 0x000E;

/// Generation number identifying one connection session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A primary service reported during service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceDescriptor {
    /// Connection the service belongs to.
    pub conn_handle: u16,
    /// First attribute handle of the service.
    pub start_handle: u16,
    /// Last attribute handle of the service.
    pub end_handle: u16,
    /// Service UUID.
    pub uuid: Uuid,
}

/// A characteristic reported during characteristic discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDescriptor {
    /// Connection the characteristic belongs to.
    pub conn_handle: u16,
    /// Handle of the characteristic declaration.
    pub def_handle: u16,
    /// Handle of the characteristic value.
    pub value_handle: u16,
    /// Characteristic property flags.
    pub properties: u8,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

/// A deferred step of the central state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleStep {
    /// Discover characteristics of the radon service.
    DiscoverCharacteristics {
        /// First handle of the service range.
        start_handle: u16,
        /// Last handle of the service range.
        end_handle: u16,
    },
    /// Write the trigger value.
    WriteTrigger,
}

/// An event delivered to the central state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// A connection attempt completed. `conn_handle` is
    /// [`INVALID_CONN_HANDLE`] when the controller rejected it.
    Connected {
        /// Assigned connection handle.
        conn_handle: u16,
        /// Peer address type.
        addr_type: AddressType,
        /// Peer address.
        address: BdAddress,
    },
    /// A connection ended, or a connection attempt failed when
    /// `conn_handle` is [`INVALID_CONN_HANDLE`].
    Disconnected {
        /// Handle of the connection that ended.
        conn_handle: u16,
        /// Peer address type.
        addr_type: AddressType,
        /// Peer address.
        address: BdAddress,
    },
    /// One service found by service discovery.
    ServiceResult(ServiceDescriptor),
    /// One characteristic found by characteristic discovery.
    CharacteristicResult(CharacteristicDescriptor),
    /// A write request completed.
    WriteStatus {
        /// Connection handle.
        conn_handle: u16,
        /// Value handle that was written.
        value_handle: u16,
        /// ATT status, [`GATT_STATUS_SUCCESS`] on success.
        status: u16,
    },
    /// A read request completed.
    ReadResult {
        /// Connection handle.
        conn_handle: u16,
        /// Value handle that was read.
        value_handle: u16,
        /// The characteristic value.
        data: Bytes,
    },
    /// A read request failed without returning a value.
    ReadFailed {
        /// Connection handle.
        conn_handle: u16,
        /// Value handle that was read.
        value_handle: u16,
        /// ATT status of the failure.
        status: u16,
    },
    /// A settle delay scheduled by the state machine elapsed.
    SettleElapsed {
        /// Session that scheduled the step.
        session: SessionId,
        /// Step to perform.
        step: SettleStep,
    },
    /// The connection watchdog fired.
    WatchdogExpired {
        /// Session the watchdog was armed for.
        session: SessionId,
    },
}

impl CentralEvent {
    /// Short name of the event kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::ServiceResult(_) => "service-result",
            Self::CharacteristicResult(_) => "characteristic-result",
            Self::WriteStatus { .. } => "write-status",
            Self::ReadResult { .. } => "read-result",
            Self::ReadFailed { .. } => "read-failed",
            Self::SettleElapsed { .. } => "settle-elapsed",
            Self::WatchdogExpired { .. } => "watchdog-expired",
        }
    }
}

/// A request issued by the central state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralCommand {
    /// Initiate a connection.
    Connect {
        /// Peer address type.
        addr_type: AddressType,
        /// Peer address.
        address: BdAddress,
        /// Connection attempt timeout.
        timeout: Duration,
    },
    /// Discover primary services.
    DiscoverServices {
        /// Connection handle.
        conn_handle: u16,
    },
    /// Discover characteristics within a handle range.
    DiscoverCharacteristics {
        /// Connection handle.
        conn_handle: u16,
        /// First handle of the range.
        start_handle: u16,
        /// Last handle of the range.
        end_handle: u16,
    },
    /// Write a characteristic value (with response).
    Write {
        /// Connection handle.
        conn_handle: u16,
        /// Value handle to write.
        value_handle: u16,
        /// Value to write.
        data: Bytes,
    },
    /// Read a characteristic value.
    Read {
        /// Connection handle.
        conn_handle: u16,
        /// Value handle to read.
        value_handle: u16,
    },
    /// Terminate a connection.
    Disconnect {
        /// Connection handle.
        conn_handle: u16,
    },
    /// Arm the connection watchdog.
    ArmWatchdog {
        /// Session to guard.
        session: SessionId,
        /// Time until forced disconnect.
        timeout: Duration,
    },
    /// Feed `event` back into the state machine after `delay`.
    Schedule {
        /// Delay before delivery.
        delay: Duration,
        /// Event to deliver.
        event: CentralEvent,
    },
    /// Hand a finished reading to the forwarding collaborator.
    Deliver(SensorReading),
}
