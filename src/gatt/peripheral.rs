//! Peripheral-role emulator of a RadonEye sensor.
//!
//! [`GattPeripheralEmulator`] mirrors the central state machine: it advertises
//! the sensor name, accepts one central, and answers a trigger write by
//! publishing a fresh simulated readout. Like the central it performs no I/O;
//! the peripheral stack applies the returned [`PeripheralCommand`]s.

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddress};
use crate::ble::advertising;
use crate::ble::uuids::{
    EMULATOR_LOCAL_NAME, RADON_READOUT_UUID, RADON_SERVICE_UUID, RADON_TRIGGER_UUID,
    TRIGGER_VALUE,
};
use crate::protocol::reading;

/// Advertising interval of the emulator.
pub const ADVERTISING_INTERVAL: Duration = Duration::from_millis(100);

/// Characteristic property: read.
pub const PROP_READ: u8 = 0x02;
/// Characteristic property: write with response.
pub const PROP_WRITE: u8 = 0x08;

/// A characteristic to register with the peripheral stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDefinition {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Property flags.
    pub properties: u8,
}

/// A service to register with the peripheral stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristics, in registration order.
    pub characteristics: Vec<CharacteristicDefinition>,
}

/// The radon service as exposed by the sensor: trigger first, then readout.
pub fn radon_service() -> ServiceDefinition {
    ServiceDefinition {
        uuid: RADON_SERVICE_UUID,
        characteristics: vec![
            CharacteristicDefinition {
                uuid: RADON_TRIGGER_UUID,
                properties: PROP_WRITE,
            },
            CharacteristicDefinition {
                uuid: RADON_READOUT_UUID,
                properties: PROP_READ,
            },
        ],
    }
}

/// Value handles assigned by the peripheral stack when registering
/// [`radon_service`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadonHandles {
    /// Value handle of the trigger characteristic.
    pub trigger: u16,
    /// Value handle of the readout characteristic.
    pub readout: u16,
}

/// The emulator's GATT profile: the radon service and the handles the
/// peripheral stack registered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattProfile {
    /// Service and characteristic definitions.
    pub service: ServiceDefinition,
    /// Registered value handles.
    pub handles: RadonHandles,
}

/// Emulator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PeripheralState {
    /// Advertising and waiting for a central.
    #[default]
    Advertising,
    /// A central is connected.
    Connected,
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Advertising => write!(f, "Advertising"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}

/// An event delivered to the emulator by the peripheral stack.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    /// A central connected.
    CentralConnected {
        /// Connection handle.
        conn_handle: u16,
        /// Central address type.
        addr_type: AddressType,
        /// Central address.
        address: BdAddress,
    },
    /// A central disconnected.
    CentralDisconnected {
        /// Connection handle.
        conn_handle: u16,
        /// Central address type.
        addr_type: AddressType,
        /// Central address.
        address: BdAddress,
    },
    /// A central wrote a local attribute.
    Write {
        /// Connection handle.
        conn_handle: u16,
        /// Attribute handle written.
        attr_handle: u16,
        /// The value now stored in the attribute.
        value: Bytes,
    },
}

/// A request issued by the emulator to the peripheral stack.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralCommand {
    /// Start (or resume) advertising.
    Advertise {
        /// Advertising interval.
        interval: Duration,
        /// Advertising payload.
        adv_data: Bytes,
        /// Whether centrals may connect.
        connectable: bool,
    },
    /// Store a new value in a local attribute.
    SetValue {
        /// Attribute handle.
        attr_handle: u16,
        /// New value.
        value: Bytes,
    },
}

/// Source of simulated sensor values.
pub trait ValueSource: Send {
    /// Produce the next raw sensor value.
    fn next_value(&mut self) -> f32;
}

/// Uniformly random values in `[0, 1)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomValueSource;

impl ValueSource for RandomValueSource {
    fn next_value(&mut self) -> f32 {
        rand::random::<f32>()
    }
}

impl<F> ValueSource for F
where
    F: FnMut() -> f32 + Send,
{
    fn next_value(&mut self) -> f32 {
        self()
    }
}

/// Peripheral-role emulator of a RadonEye sensor.
pub struct GattPeripheralEmulator<V: ValueSource = RandomValueSource> {
    handles: RadonHandles,
    state: PeripheralState,
    conn_handle: Option<u16>,
    adv_data: Bytes,
    values: V,
    last_value: Option<f32>,
}

impl GattPeripheralEmulator<RandomValueSource> {
    /// Create an emulator publishing random values.
    pub fn new(handles: RadonHandles) -> Self {
        Self::with_source(handles, RandomValueSource)
    }
}

impl<V: ValueSource> GattPeripheralEmulator<V> {
    /// Create an emulator publishing values from `values`.
    pub fn with_source(handles: RadonHandles, values: V) -> Self {
        Self {
            handles,
            state: PeripheralState::Advertising,
            conn_handle: None,
            adv_data: Bytes::from(advertising::name_payload(EMULATOR_LOCAL_NAME)),
            values,
            last_value: None,
        }
    }

    /// Get the current state.
    pub fn state(&self) -> PeripheralState {
        self.state
    }

    /// Get the handles the emulator serves.
    pub fn handles(&self) -> RadonHandles {
        self.handles
    }

    /// Get the profile the emulator serves.
    pub fn profile(&self) -> GattProfile {
        GattProfile {
            service: radon_service(),
            handles: self.handles,
        }
    }

    /// Get the connected central's connection handle.
    pub fn conn_handle(&self) -> Option<u16> {
        self.conn_handle
    }

    /// Get the advertising payload.
    pub fn adv_data(&self) -> &Bytes {
        &self.adv_data
    }

    /// Get the most recently published raw value.
    pub fn last_value(&self) -> Option<f32> {
        self.last_value
    }

    /// Begin advertising.
    pub fn start(&mut self) -> Vec<PeripheralCommand> {
        info!("Advertising as {:?}", EMULATOR_LOCAL_NAME);
        self.state = PeripheralState::Advertising;
        vec![self.advertise()]
    }

    /// Process one event from the peripheral stack.
    pub fn handle(&mut self, event: PeripheralEvent) -> Vec<PeripheralCommand> {
        match event {
            PeripheralEvent::CentralConnected {
                conn_handle,
                address,
                ..
            } => {
                if let Some(current) = self.conn_handle {
                    warn!(
                        "Ignoring second central {} (conn {}), already serving conn {}",
                        address, conn_handle, current
                    );
                    return Vec::new();
                }
                info!("Central device connected: {}", address);
                self.conn_handle = Some(conn_handle);
                self.state = PeripheralState::Connected;
                Vec::new()
            }
            PeripheralEvent::CentralDisconnected {
                conn_handle,
                address,
                ..
            } => {
                if self.conn_handle != Some(conn_handle) {
                    debug!("Ignoring disconnect of unknown conn {}", conn_handle);
                    return Vec::new();
                }
                info!("Central device disconnected: {}", address);
                info!("Continuing to advertise");
                self.conn_handle = None;
                self.state = PeripheralState::Advertising;
                vec![self.advertise()]
            }
            PeripheralEvent::Write {
                conn_handle,
                attr_handle,
                value,
            } => self.on_write(conn_handle, attr_handle, value),
        }
    }

    fn on_write(&mut self, conn_handle: u16, attr_handle: u16, value: Bytes) -> Vec<PeripheralCommand> {
        info!(
            "GATT write occurred: conn {} on {}, new value: {:02x?}",
            conn_handle, attr_handle, &value[..]
        );

        if self.conn_handle != Some(conn_handle) {
            debug!("Ignoring write from unserved conn {}", conn_handle);
            return Vec::new();
        }

        if attr_handle != self.handles.trigger || value[..] != [TRIGGER_VALUE] {
            return Vec::new();
        }

        let reading = self.values.next_value();
        self.last_value = Some(reading);
        info!("Triggered radon readout. Writing {} to readout", reading);

        vec![
            PeripheralCommand::SetValue {
                attr_handle: self.handles.trigger,
                value: Bytes::from_static(&[0x00]),
            },
            PeripheralCommand::SetValue {
                attr_handle: self.handles.readout,
                value: Bytes::copy_from_slice(&reading::encode(reading)),
            },
        ]
    }

    fn advertise(&self) -> PeripheralCommand {
        PeripheralCommand::Advertise {
            interval: ADVERTISING_INTERVAL,
            adv_data: self.adv_data.clone(),
            connectable: true,
        }
    }
}

impl<V: ValueSource> fmt::Debug for GattPeripheralEmulator<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GattPeripheralEmulator")
            .field("handles", &self.handles)
            .field("state", &self.state)
            .field("conn_handle", &self.conn_handle)
            .field("last_value", &self.last_value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertising::decode_name;
    use pretty_assertions::assert_eq;

    const HANDLES: RadonHandles = RadonHandles {
        trigger: 0x0012,
        readout: 0x0014,
    };

    fn central() -> BdAddress {
        BdAddress::new([0x24, 0x0A, 0xC4, 0x00, 0x00, 0x01])
    }

    fn connect(conn_handle: u16) -> PeripheralEvent {
        PeripheralEvent::CentralConnected {
            conn_handle,
            addr_type: AddressType::Public,
            address: central(),
        }
    }

    fn write(attr_handle: u16, value: &'static [u8]) -> PeripheralEvent {
        PeripheralEvent::Write {
            conn_handle: 1,
            attr_handle,
            value: Bytes::from_static(value),
        }
    }

    fn readout_publishes(commands: &[PeripheralCommand]) -> Vec<Bytes> {
        commands
            .iter()
            .filter_map(|c| match c {
                PeripheralCommand::SetValue { attr_handle, value }
                    if *attr_handle == HANDLES.readout =>
                {
                    Some(value.clone())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_start_advertises_name() {
        let mut emulator = GattPeripheralEmulator::new(HANDLES);
        let commands = emulator.start();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            PeripheralCommand::Advertise {
                interval,
                adv_data,
                connectable,
            } => {
                assert_eq!(*interval, Duration::from_millis(100));
                assert!(*connectable);
                assert_eq!(decode_name(adv_data).as_text(), Some("RadonEye-Spoofer"));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_trigger_write_publishes_once() {
        let mut emulator = GattPeripheralEmulator::new(HANDLES);
        emulator.start();
        emulator.handle(connect(1));
        assert_eq!(emulator.state(), PeripheralState::Connected);

        let commands = emulator.handle(write(HANDLES.trigger, b"P"));
        assert_eq!(
            commands[0],
            PeripheralCommand::SetValue {
                attr_handle: HANDLES.trigger,
                value: Bytes::from_static(&[0x00]),
            }
        );

        let published = readout_publishes(&commands);
        assert_eq!(published.len(), 1);
        let payload = &published[0];
        assert_eq!(payload.len(), 6);
        assert_eq!(&payload[..2], &[0x00, 0x00]);
        let value = f32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);
        assert!((0.0..1.0).contains(&value));
        assert_eq!(emulator.last_value(), Some(value));
    }

    #[test]
    fn test_other_writes_ignored() {
        let mut emulator = GattPeripheralEmulator::new(HANDLES);
        emulator.handle(connect(1));

        assert!(emulator.handle(write(HANDLES.trigger, b"Q")).is_empty());
        assert!(emulator.handle(write(HANDLES.trigger, b"PP")).is_empty());
        assert!(emulator.handle(write(HANDLES.trigger, b"")).is_empty());
        assert!(emulator.handle(write(HANDLES.readout, b"P")).is_empty());
        assert!(emulator.handle(write(0x0099, b"P")).is_empty());
        assert_eq!(emulator.last_value(), None);
    }

    #[test]
    fn test_value_source_roundtrip() {
        let mut emulator = GattPeripheralEmulator::with_source(HANDLES, || 0.75f32);
        emulator.handle(connect(1));
        let commands = emulator.handle(write(HANDLES.trigger, b"P"));
        let published = readout_publishes(&commands);
        let decoded = reading::decode(&published[0]).unwrap();
        assert!((decoded - 0.75 * 37.0).abs() < 1e-4);
    }

    #[test]
    fn test_disconnect_resumes_advertising() {
        let mut emulator = GattPeripheralEmulator::new(HANDLES);
        let start = emulator.start();
        emulator.handle(connect(1));

        let commands = emulator.handle(PeripheralEvent::CentralDisconnected {
            conn_handle: 1,
            addr_type: AddressType::Public,
            address: central(),
        });
        assert_eq!(commands, start);
        assert_eq!(emulator.state(), PeripheralState::Advertising);
        assert_eq!(emulator.conn_handle(), None);
    }

    #[test]
    fn test_second_central_ignored() {
        let mut emulator = GattPeripheralEmulator::new(HANDLES);
        emulator.handle(connect(1));
        assert!(emulator.handle(connect(2)).is_empty());
        assert_eq!(emulator.conn_handle(), Some(1));

        // Disconnect of the ignored central leaves the first one in place
        let commands = emulator.handle(PeripheralEvent::CentralDisconnected {
            conn_handle: 2,
            addr_type: AddressType::Public,
            address: central(),
        });
        assert!(commands.is_empty());
        assert_eq!(emulator.state(), PeripheralState::Connected);
    }

    #[test]
    fn test_trigger_from_unserved_central_ignored() {
        let mut emulator = GattPeripheralEmulator::with_source(HANDLES, || 0.5f32);

        // No central yet
        assert!(emulator.handle(write(HANDLES.trigger, b"P")).is_empty());

        emulator.handle(connect(1));
        emulator.handle(connect(2));
        let commands = emulator.handle(PeripheralEvent::Write {
            conn_handle: 2,
            attr_handle: HANDLES.trigger,
            value: Bytes::from_static(b"P"),
        });
        assert!(commands.is_empty());
        assert_eq!(emulator.last_value(), None);

        // The served central still triggers readouts
        let commands = emulator.handle(write(HANDLES.trigger, b"P"));
        assert_eq!(readout_publishes(&commands).len(), 1);
        assert_eq!(emulator.last_value(), Some(0.5));
    }

    #[test]
    fn test_radon_service_definition() {
        let service = radon_service();
        assert_eq!(service.uuid, RADON_SERVICE_UUID);
        assert_eq!(service.characteristics.len(), 2);
        assert_eq!(service.characteristics[0].uuid, RADON_TRIGGER_UUID);
        assert_eq!(service.characteristics[0].properties, PROP_WRITE);
        assert_eq!(service.characteristics[1].uuid, RADON_READOUT_UUID);
        assert_eq!(service.characteristics[1].properties, PROP_READ);
    }

    #[test]
    fn test_profile_carries_handles() {
        let emulator = GattPeripheralEmulator::new(HANDLES);
        let profile = emulator.profile();
        assert_eq!(profile.service, radon_service());
        assert_eq!(profile.handles, HANDLES);
    }
}
