//! Central-role state machine for reading a RadonEye sensor.
//!
//! [`GattCentral`] performs no I/O. Each radio event is fed to
//! [`GattCentral::handle`], which updates the single connection session and
//! returns the requests to issue next. A readout cycle runs:
//!
//! ```text
//! Idle -> Connecting -> ServiceDiscovery -> CharacteristicDiscovery
//!      -> AwaitingHandles -> Writing -> AwaitingWriteStatus
//!      -> Reading -> AwaitingReadResult -> Disconnecting -> Done
//! ```
//!
//! A disconnect of the current session ends the cycle from any state.
//! Events naming a connection that is not the current session are ignored,
//! so late timer expirations and stray discovery results are harmless.

use bytes::Bytes;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::ble::address::{AddressType, BdAddress};
use crate::ble::uuids::{
    is_radon_service, RADON_READOUT_UUID, RADON_TRIGGER_UUID, TRIGGER_VALUE,
};
use crate::error::{Error, Result};
use crate::gatt::events::{
    CentralCommand, CentralEvent, CharacteristicDescriptor, ServiceDescriptor, SessionId,
    SettleStep, GATT_STATUS_SUCCESS, INVALID_CONN_HANDLE,
};
use crate::protocol::SensorReading;

/// Timing parameters of a readout cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CentralTimings {
    /// Timeout passed to the controller for the connection attempt.
    pub connect_timeout: Duration,
    /// Wait before characteristic discovery and before the trigger write.
    pub settle_delay: Duration,
    /// Maximum lifetime of a connection before it is forcibly closed.
    pub watchdog_timeout: Duration,
}

impl CentralTimings {
    /// Default connection attempt timeout (2 seconds).
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);
    /// Default settle delay (500 ms).
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
    /// Default watchdog timeout (10 seconds).
    pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for CentralTimings {
    fn default() -> Self {
        Self {
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
            watchdog_timeout: Self::DEFAULT_WATCHDOG_TIMEOUT,
        }
    }
}

/// State of the central state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CentralState {
    /// No cycle has run yet.
    #[default]
    Idle,
    /// Waiting for the connection attempt to complete.
    Connecting,
    /// Waiting for the radon service to be reported.
    ServiceDiscovery,
    /// Radon service found, characteristic discovery pending or running.
    CharacteristicDiscovery,
    /// One of the two characteristic handles is known.
    AwaitingHandles,
    /// Both handles known, trigger write pending.
    Writing,
    /// Trigger written, waiting for its status.
    AwaitingWriteStatus,
    /// Issuing the readout request.
    Reading,
    /// Waiting for the readout value.
    AwaitingReadResult,
    /// Disconnect requested.
    Disconnecting,
    /// The session has ended.
    Done,
    /// The connection attempt was rejected.
    Failed,
}

impl CentralState {
    /// Check if a cycle has finished (or none has started).
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Idle | Self::Done | Self::Failed)
    }

    /// Check if a connection is established.
    pub fn is_connected(&self) -> bool {
        !self.is_finished() && *self != Self::Connecting
    }
}

impl fmt::Display for CentralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Connecting => "Connecting",
            Self::ServiceDiscovery => "ServiceDiscovery",
            Self::CharacteristicDiscovery => "CharacteristicDiscovery",
            Self::AwaitingHandles => "AwaitingHandles",
            Self::Writing => "Writing",
            Self::AwaitingWriteStatus => "AwaitingWriteStatus",
            Self::Reading => "Reading",
            Self::AwaitingReadResult => "AwaitingReadResult",
            Self::Disconnecting => "Disconnecting",
            Self::Done => "Done",
            Self::Failed => "Failed",
        };
        write!(f, "{}", name)
    }
}

/// Why a readout cycle did not produce a reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleFailure {
    /// The controller rejected the connection attempt.
    ConnectionRejected,
    /// The trigger write completed with a non-success status.
    WriteRejected {
        /// The ATT status reported.
        status: u16,
    },
    /// The readout request failed without returning a value.
    ReadRejected {
        /// The ATT status reported.
        status: u16,
    },
    /// The readout payload was too short to decode.
    PayloadTooShort {
        /// Length of the payload received.
        len: usize,
    },
    /// The watchdog closed the connection before the cycle completed.
    WatchdogExpired,
}

impl fmt::Display for CycleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionRejected => write!(f, "connection rejected"),
            Self::WriteRejected { status } => write!(f, "write rejected (status {:#04x})", status),
            Self::ReadRejected { status } => write!(f, "read rejected (status {:#04x})", status),
            Self::PayloadTooShort { len } => write!(f, "payload too short ({} bytes)", len),
            Self::WatchdogExpired => write!(f, "watchdog expired"),
        }
    }
}

/// The single active connection to the sensor.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    /// Session generation.
    pub id: SessionId,
    /// Controller connection handle.
    pub conn_handle: u16,
    /// Peer address.
    pub address: BdAddress,
    /// Peer address type.
    pub addr_type: AddressType,
    /// Value handle of the trigger characteristic, once discovered.
    pub write_handle: Option<u16>,
    /// Value handle of the readout characteristic, once discovered.
    pub read_handle: Option<u16>,
    /// Whether the trigger write awaits its status.
    pub write_outstanding: bool,
    /// Value handle of the read awaiting its result.
    pub read_outstanding: Option<u16>,
    /// Whether a disconnect was requested.
    pub disconnect_requested: bool,
    /// When the connection was established.
    pub created_at: Instant,
}

impl ConnectionSession {
    fn new(id: SessionId, conn_handle: u16, address: BdAddress, addr_type: AddressType) -> Self {
        Self {
            id,
            conn_handle,
            address,
            addr_type,
            write_handle: None,
            read_handle: None,
            write_outstanding: false,
            read_outstanding: None,
            disconnect_requested: false,
            created_at: Instant::now(),
        }
    }

    /// Both characteristic handles, if known.
    pub fn handles(&self) -> Option<(u16, u16)> {
        Some((self.write_handle?, self.read_handle?))
    }
}

/// Central-role state machine driving one sensor readout per cycle.
#[derive(Debug)]
pub struct GattCentral {
    state: CentralState,
    session: Option<ConnectionSession>,
    timings: CentralTimings,
    next_session: u64,
    last_failure: Option<CycleFailure>,
}

impl GattCentral {
    /// Create a new state machine.
    pub fn new(timings: CentralTimings) -> Self {
        Self {
            state: CentralState::Idle,
            session: None,
            timings,
            next_session: 1,
            last_failure: None,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CentralState {
        self.state
    }

    /// Get the active session, if any.
    pub fn session(&self) -> Option<&ConnectionSession> {
        self.session.as_ref()
    }

    /// Get the failure recorded for the current (or last) cycle.
    pub fn last_failure(&self) -> Option<CycleFailure> {
        self.last_failure
    }

    /// Get the timing parameters.
    pub fn timings(&self) -> &CentralTimings {
        &self.timings
    }

    /// Start a readout cycle against `address`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionBusy`] while a previous cycle is still running.
    pub fn begin(
        &mut self,
        address: BdAddress,
        addr_type: AddressType,
    ) -> Result<Vec<CentralCommand>> {
        if self.session.is_some() || !self.state.is_finished() {
            return Err(Error::SessionBusy);
        }

        info!("Starting radon readout from {} ({})", address, addr_type);

        self.last_failure = None;
        self.set_state(CentralState::Connecting);

        Ok(vec![CentralCommand::Connect {
            addr_type,
            address,
            timeout: self.timings.connect_timeout,
        }])
    }

    /// Drop the active session without waiting for the radio.
    ///
    /// Events that still arrive for the abandoned session are no-ops.
    pub fn abandon(&mut self) -> Option<ConnectionSession> {
        let session = self.session.take();
        if let Some(session) = &session {
            warn!(
                "Abandoning session {} on connection {} in state {}",
                session.id, session.conn_handle, self.state
            );
        }
        if !self.state.is_finished() {
            self.set_state(CentralState::Failed);
        }
        session
    }

    /// Process one radio or timer event.
    pub fn handle(&mut self, event: CentralEvent) -> Vec<CentralCommand> {
        match event {
            CentralEvent::Connected {
                conn_handle,
                addr_type,
                address,
            } => self.on_connected(conn_handle, addr_type, address),
            CentralEvent::Disconnected {
                conn_handle,
                address,
                ..
            } => self.on_disconnected(conn_handle, address),
            CentralEvent::ServiceResult(service) => self.on_service(service),
            CentralEvent::CharacteristicResult(characteristic) => {
                self.on_characteristic(characteristic)
            }
            CentralEvent::WriteStatus {
                conn_handle,
                value_handle,
                status,
            } => self.on_write_status(conn_handle, value_handle, status),
            CentralEvent::ReadResult {
                conn_handle,
                value_handle,
                data,
            } => self.on_read_result(conn_handle, value_handle, data),
            CentralEvent::ReadFailed {
                conn_handle,
                value_handle,
                status,
            } => self.on_read_failed(conn_handle, value_handle, status),
            CentralEvent::SettleElapsed { session, step } => self.on_settle(session, step),
            CentralEvent::WatchdogExpired { session } => self.on_watchdog(session),
        }
    }

    fn on_connected(
        &mut self,
        conn_handle: u16,
        addr_type: AddressType,
        address: BdAddress,
    ) -> Vec<CentralCommand> {
        if self.state != CentralState::Connecting || self.session.is_some() {
            warn!(
                "Unexpected connection {} to {} in state {}",
                conn_handle, address, self.state
            );
            let is_current = self
                .session
                .as_ref()
                .map(|s| s.conn_handle == conn_handle)
                .unwrap_or(false);
            if conn_handle != INVALID_CONN_HANDLE && !is_current {
                return vec![CentralCommand::Disconnect { conn_handle }];
            }
            return Vec::new();
        }

        if conn_handle == INVALID_CONN_HANDLE {
            error!("BT connection to {} failed", address);
            self.last_failure = Some(CycleFailure::ConnectionRejected);
            self.set_state(CentralState::Failed);
            return Vec::new();
        }

        let id = SessionId(self.next_session);
        self.next_session += 1;

        info!(
            "BT connected: conn_handle {} addr {} (session {})",
            conn_handle, address, id
        );

        self.session = Some(ConnectionSession::new(id, conn_handle, address, addr_type));
        self.set_state(CentralState::ServiceDiscovery);

        vec![
            CentralCommand::ArmWatchdog {
                session: id,
                timeout: self.timings.watchdog_timeout,
            },
            CentralCommand::DiscoverServices { conn_handle },
        ]
    }

    fn on_disconnected(&mut self, conn_handle: u16, address: BdAddress) -> Vec<CentralCommand> {
        if conn_handle == INVALID_CONN_HANDLE {
            if self.state == CentralState::Connecting && self.session.is_none() {
                error!("BT connection to {} failed", address);
                self.last_failure = Some(CycleFailure::ConnectionRejected);
                self.set_state(CentralState::Failed);
            } else {
                debug!("Ignoring failed-connection report in state {}", self.state);
            }
            return Vec::new();
        }

        match self.session.take() {
            Some(session) if session.conn_handle == conn_handle => {
                info!(
                    "BT disconnected: conn_handle {} after {:?}",
                    conn_handle,
                    session.created_at.elapsed()
                );
                self.set_state(CentralState::Done);
            }
            other => {
                self.session = other;
                debug!("Ignoring disconnect of unknown connection {}", conn_handle);
            }
        }

        Vec::new()
    }

    fn on_service(&mut self, service: ServiceDescriptor) -> Vec<CentralCommand> {
        let state = self.state;
        let settle_delay = self.timings.settle_delay;
        let Some(session) = self.session_for(service.conn_handle) else {
            return Vec::new();
        };

        debug!(
            "Service {} on conn {}: handles {:#06x}..{:#06x}",
            service.uuid, service.conn_handle, service.start_handle, service.end_handle
        );

        if !is_radon_service(&service.uuid) {
            return Vec::new();
        }

        if state != CentralState::ServiceDiscovery {
            debug!("Radon service reported again in state {}, ignoring", state);
            return Vec::new();
        }

        info!("Found radon service, fetching characteristics");

        let command = CentralCommand::Schedule {
            delay: settle_delay,
            event: CentralEvent::SettleElapsed {
                session: session.id,
                step: SettleStep::DiscoverCharacteristics {
                    start_handle: service.start_handle,
                    end_handle: service.end_handle,
                },
            },
        };
        self.set_state(CentralState::CharacteristicDiscovery);
        vec![command]
    }

    fn on_characteristic(
        &mut self,
        characteristic: CharacteristicDescriptor,
    ) -> Vec<CentralCommand> {
        let state = self.state;
        let settle_delay = self.timings.settle_delay;
        let Some(session) = self.session_for(characteristic.conn_handle) else {
            return Vec::new();
        };

        debug!(
            "Characteristic {} on conn {}: def {:#06x} value {:#06x} props {:#04x}",
            characteristic.uuid,
            characteristic.conn_handle,
            characteristic.def_handle,
            characteristic.value_handle,
            characteristic.properties
        );

        if !matches!(
            state,
            CentralState::CharacteristicDiscovery | CentralState::AwaitingHandles
        ) {
            debug!("Ignoring characteristic in state {}", state);
            return Vec::new();
        }

        if characteristic.uuid == RADON_READOUT_UUID {
            info!("Found radon read-out characteristic");
            session.read_handle = Some(characteristic.value_handle);
        } else if characteristic.uuid == RADON_TRIGGER_UUID {
            info!("Found radon update trigger characteristic");
            session.write_handle = Some(characteristic.value_handle);
        } else {
            return Vec::new();
        }

        if session.handles().is_some() {
            let command = CentralCommand::Schedule {
                delay: settle_delay,
                event: CentralEvent::SettleElapsed {
                    session: session.id,
                    step: SettleStep::WriteTrigger,
                },
            };
            self.set_state(CentralState::Writing);
            vec![command]
        } else {
            self.set_state(CentralState::AwaitingHandles);
            Vec::new()
        }
    }

    fn on_settle(&mut self, id: SessionId, step: SettleStep) -> Vec<CentralCommand> {
        let state = self.state;
        let session = match self.session.as_mut() {
            Some(session) if session.id == id => session,
            _ => {
                debug!("Settle step for ended session {}, ignoring", id);
                return Vec::new();
            }
        };

        match step {
            SettleStep::DiscoverCharacteristics {
                start_handle,
                end_handle,
            } if state == CentralState::CharacteristicDiscovery => {
                vec![CentralCommand::DiscoverCharacteristics {
                    conn_handle: session.conn_handle,
                    start_handle,
                    end_handle,
                }]
            }
            SettleStep::WriteTrigger
                if state == CentralState::Writing && !session.write_outstanding =>
            {
                let Some((write_handle, _)) = session.handles() else {
                    return Vec::new();
                };
                info!(
                    "Writing {:#04x} to value handle {} on conn {}",
                    TRIGGER_VALUE, write_handle, session.conn_handle
                );
                session.write_outstanding = true;
                let command = CentralCommand::Write {
                    conn_handle: session.conn_handle,
                    value_handle: write_handle,
                    data: Bytes::from_static(&[TRIGGER_VALUE]),
                };
                self.set_state(CentralState::AwaitingWriteStatus);
                vec![command]
            }
            _ => {
                debug!("Settle step {:?} no longer applies in state {}", step, state);
                Vec::new()
            }
        }
    }

    fn on_write_status(
        &mut self,
        conn_handle: u16,
        value_handle: u16,
        status: u16,
    ) -> Vec<CentralCommand> {
        let state = self.state;
        let Some(session) = self.session_for(conn_handle) else {
            return Vec::new();
        };

        debug!("Write status {:#04x} for handle {}", status, value_handle);

        if state != CentralState::AwaitingWriteStatus || !session.write_outstanding {
            debug!("Ignoring write status in state {}", state);
            return Vec::new();
        }
        session.write_outstanding = false;

        if status != GATT_STATUS_SUCCESS {
            error!("Write request failed with status {:#04x}", status);
            self.last_failure = Some(CycleFailure::WriteRejected { status });
            return self.request_disconnect();
        }

        // Handles are cleared so the session is ready for the next discovery
        let read_handle = session.read_handle.take();
        session.write_handle = None;

        let Some(read_handle) = read_handle else {
            error!("Read handle lost before readout");
            return self.request_disconnect();
        };
        session.read_outstanding = Some(read_handle);

        let command = CentralCommand::Read {
            conn_handle,
            value_handle: read_handle,
        };
        self.set_state(CentralState::Reading);
        self.set_state(CentralState::AwaitingReadResult);
        vec![command]
    }

    fn on_read_result(
        &mut self,
        conn_handle: u16,
        value_handle: u16,
        data: Bytes,
    ) -> Vec<CentralCommand> {
        let state = self.state;
        let Some(session) = self.session_for(conn_handle) else {
            return Vec::new();
        };

        if state != CentralState::AwaitingReadResult
            || session.read_outstanding != Some(value_handle)
        {
            debug!(
                "Ignoring read result for handle {} in state {}",
                value_handle, state
            );
            return Vec::new();
        }
        session.read_outstanding = None;

        debug!("Read value handle {}: {:02x?}", value_handle, &data[..]);

        let len = data.len();
        match SensorReading::from_payload(data) {
            Ok(reading) => {
                info!("Decoded radon value: {}", reading);
                let mut commands = self.request_disconnect();
                commands.push(CentralCommand::Deliver(reading));
                commands
            }
            Err(e) => {
                error!("Could not decode readout: {}", e);
                self.last_failure = Some(CycleFailure::PayloadTooShort { len });
                self.request_disconnect()
            }
        }
    }

    fn on_read_failed(
        &mut self,
        conn_handle: u16,
        value_handle: u16,
        status: u16,
    ) -> Vec<CentralCommand> {
        let state = self.state;
        let Some(session) = self.session_for(conn_handle) else {
            return Vec::new();
        };

        if state != CentralState::AwaitingReadResult
            || session.read_outstanding != Some(value_handle)
        {
            debug!(
                "Ignoring read failure for handle {} in state {}",
                value_handle, state
            );
            return Vec::new();
        }
        session.read_outstanding = None;

        error!("Read request failed with status {:#04x}", status);
        self.last_failure = Some(CycleFailure::ReadRejected { status });
        self.request_disconnect()
    }

    fn on_watchdog(&mut self, id: SessionId) -> Vec<CentralCommand> {
        match self.session.as_ref() {
            Some(session) if session.id == id && session.disconnect_requested => {
                debug!(
                    "Watchdog for session {} while disconnect is pending, ignoring",
                    id
                );
                Vec::new()
            }
            Some(session) if session.id == id => {
                warn!(
                    "Connection watchdog expired for session {} in state {}",
                    id, self.state
                );
                if self.last_failure.is_none() {
                    self.last_failure = Some(CycleFailure::WatchdogExpired);
                }
                self.request_disconnect()
            }
            _ => {
                debug!("Watchdog for ended session {}, ignoring", id);
                Vec::new()
            }
        }
    }

    /// Look up the session owning `conn_handle`.
    fn session_for(&mut self, conn_handle: u16) -> Option<&mut ConnectionSession> {
        match self.session.as_mut() {
            Some(session) if session.conn_handle == conn_handle => Some(session),
            Some(_) => {
                debug!("Ignoring event for unknown connection {}", conn_handle);
                None
            }
            None => {
                debug!("Ignoring event for connection {} without session", conn_handle);
                None
            }
        }
    }

    fn request_disconnect(&mut self) -> Vec<CentralCommand> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        session.disconnect_requested = true;
        let conn_handle = session.conn_handle;
        self.set_state(CentralState::Disconnecting);
        vec![CentralCommand::Disconnect { conn_handle }]
    }

    fn set_state(&mut self, new_state: CentralState) {
        if self.state != new_state {
            debug!("Central state changed: {} -> {}", self.state, new_state);
            self.state = new_state;
        }
    }
}

impl Default for GattCentral {
    fn default() -> Self {
        Self::new(CentralTimings::default())
    }
}
