//! In-memory radio connecting the central role to the sensor emulator.
//!
//! [`LoopbackLink`] implements [`CentralLink`] on top of a
//! [`GattPeripheralEmulator`] and a small attribute table, so a complete
//! readout cycle runs without Bluetooth hardware. Faults can be injected to
//! exercise the failure paths of the reader.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddress};
use crate::ble::uuids::{
    DEVICE_NAME_UUID, EMULATOR_LOCAL_NAME, GENERIC_ACCESS_SERVICE_UUID, RADON_SERVICE_UUID,
    RADON_TRIGGER_UUID,
};
use crate::error::{Error, Result};
use crate::gatt::events::{
    CentralEvent, CharacteristicDescriptor, ServiceDescriptor, GATT_STATUS_SUCCESS,
    INVALID_CONN_HANDLE,
};
use crate::gatt::link::CentralLink;
use crate::gatt::peripheral::{
    GattPeripheralEmulator, PeripheralCommand, PeripheralEvent, PeripheralState,
    RadonHandles, RandomValueSource, ValueSource, PROP_READ, PROP_WRITE,
};

/// Connection handle assigned to the loopback connection.
pub const LOOPBACK_CONN_HANDLE: u16 = 0x0040;

/// Address the loopback central presents to the emulator.
pub const LOOPBACK_CENTRAL_ADDRESS: BdAddress =
    BdAddress::new([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

/// ATT error: invalid handle.
pub const ATT_INVALID_HANDLE: u16 = 0x01;
/// ATT error: write not permitted.
pub const ATT_WRITE_NOT_PERMITTED: u16 = 0x03;

const GAP_SERVICE: (u16, u16) = (0x0001, 0x0007);
const DEVICE_NAME_DEF: u16 = 0x0002;
const DEVICE_NAME_VALUE: u16 = 0x0003;

const RADON_SERVICE: (u16, u16) = (0x0010, 0x0015);
const TRIGGER_VALUE_HANDLE: u16 = 0x0012;
const READOUT_VALUE_HANDLE: u16 = 0x0014;

/// Handles the emulator registers for the radon service.
pub const LOOPBACK_HANDLES: RadonHandles = RadonHandles {
    trigger: TRIGGER_VALUE_HANDLE,
    readout: READOUT_VALUE_HANDLE,
};

/// Faults the loopback radio can simulate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopbackFaults {
    /// Report every connection attempt as failed.
    pub reject_connection: bool,
    /// Complete writes with this ATT status instead of applying them.
    pub write_status: Option<u16>,
    /// Accept read requests but never report a result.
    pub drop_reads: bool,
    /// Fail write requests before they reach the radio.
    pub refuse_writes: bool,
    /// Fail read requests before they reach the radio.
    pub refuse_reads: bool,
    /// Leave the radon service out of service discovery.
    pub hide_service: bool,
}

struct Characteristic {
    service: Uuid,
    uuid: Uuid,
    def_handle: u16,
    value_handle: u16,
    properties: u8,
}

struct LoopbackState<V: ValueSource> {
    emulator: GattPeripheralEmulator<V>,
    attributes: HashMap<u16, Bytes>,
    characteristics: Vec<Characteristic>,
    advertising: Option<Bytes>,
    connection: Option<u16>,
    faults: LoopbackFaults,
}

impl<V: ValueSource> LoopbackState<V> {
    fn apply(&mut self, commands: Vec<PeripheralCommand>) {
        for command in commands {
            match command {
                PeripheralCommand::Advertise {
                    interval, adv_data, ..
                } => {
                    trace!("Loopback advertising every {:?}", interval);
                    self.advertising = Some(adv_data);
                }
                PeripheralCommand::SetValue { attr_handle, value } => {
                    trace!("Loopback attribute {:#06x} = {:02x?}", attr_handle, &value[..]);
                    self.attributes.insert(attr_handle, value);
                }
            }
        }
    }

    fn require_connection(&self, conn_handle: u16) -> Result<()> {
        if self.connection == Some(conn_handle) {
            Ok(())
        } else {
            Err(Error::NotConnected)
        }
    }
}

/// Loopback radio between the central role and the sensor emulator.
pub struct LoopbackLink<V: ValueSource = RandomValueSource> {
    address: BdAddress,
    state: Mutex<LoopbackState<V>>,
    events: mpsc::UnboundedSender<CentralEvent>,
}

impl LoopbackLink<RandomValueSource> {
    /// Create a link to an emulated sensor at `address` publishing random values.
    pub fn new(address: BdAddress, events: mpsc::UnboundedSender<CentralEvent>) -> Self {
        Self::with_source(address, RandomValueSource, events)
    }
}

impl<V: ValueSource> LoopbackLink<V> {
    /// Create a link to an emulated sensor publishing values from `values`.
    pub fn with_source(
        address: BdAddress,
        values: V,
        events: mpsc::UnboundedSender<CentralEvent>,
    ) -> Self {
        let emulator = GattPeripheralEmulator::with_source(LOOPBACK_HANDLES, values);
        let profile = emulator.profile();

        let mut characteristics = vec![Characteristic {
            service: GENERIC_ACCESS_SERVICE_UUID,
            uuid: DEVICE_NAME_UUID,
            def_handle: DEVICE_NAME_DEF,
            value_handle: DEVICE_NAME_VALUE,
            properties: PROP_READ,
        }];
        for definition in &profile.service.characteristics {
            let value_handle = if definition.uuid == RADON_TRIGGER_UUID {
                profile.handles.trigger
            } else {
                profile.handles.readout
            };
            characteristics.push(Characteristic {
                service: profile.service.uuid,
                uuid: definition.uuid,
                def_handle: value_handle - 1,
                value_handle,
                properties: definition.properties,
            });
        }

        let mut attributes = HashMap::new();
        attributes.insert(
            DEVICE_NAME_VALUE,
            Bytes::from_static(EMULATOR_LOCAL_NAME.as_bytes()),
        );
        attributes.insert(TRIGGER_VALUE_HANDLE, Bytes::new());
        attributes.insert(READOUT_VALUE_HANDLE, Bytes::new());

        let mut state = LoopbackState {
            emulator,
            attributes,
            characteristics,
            advertising: None,
            connection: None,
            faults: LoopbackFaults::default(),
        };
        let commands = state.emulator.start();
        state.apply(commands);

        Self {
            address,
            state: Mutex::new(state),
            events,
        }
    }

    /// Replace the injected faults.
    pub fn set_faults(&self, faults: LoopbackFaults) {
        self.state.lock().faults = faults;
    }

    /// Builder-style variant of [`LoopbackLink::set_faults`].
    pub fn with_faults(self, faults: LoopbackFaults) -> Self {
        self.set_faults(faults);
        self
    }

    /// Address of the emulated sensor.
    pub fn address(&self) -> BdAddress {
        self.address
    }

    /// Current emulator state.
    pub fn emulator_state(&self) -> PeripheralState {
        self.state.lock().emulator.state()
    }

    /// Last raw value the emulator published.
    pub fn last_value(&self) -> Option<f32> {
        self.state.lock().emulator.last_value()
    }

    /// Current advertising payload, if advertising.
    pub fn advertising(&self) -> Option<Bytes> {
        let state = self.state.lock();
        if state.connection.is_some() {
            None
        } else {
            state.advertising.clone()
        }
    }

    /// Stored value of an attribute.
    pub fn attribute(&self, handle: u16) -> Option<Bytes> {
        self.state.lock().attributes.get(&handle).cloned()
    }

    /// Whether a central is connected.
    pub fn is_connected(&self) -> bool {
        self.state.lock().connection.is_some()
    }

    fn emit(&self, event: CentralEvent) {
        trace!("Loopback event: {}", event.kind());
        if self.events.send(event).is_err() {
            debug!("Central event receiver dropped");
        }
    }
}

#[async_trait]
impl<V: ValueSource> CentralLink for LoopbackLink<V> {
    async fn connect(
        &self,
        addr_type: AddressType,
        address: BdAddress,
        _timeout: Duration,
    ) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            let reachable = address == self.address
                && !state.faults.reject_connection
                && state.connection.is_none();

            if reachable {
                state.connection = Some(LOOPBACK_CONN_HANDLE);
                let commands = state.emulator.handle(PeripheralEvent::CentralConnected {
                    conn_handle: LOOPBACK_CONN_HANDLE,
                    addr_type: AddressType::Public,
                    address: LOOPBACK_CENTRAL_ADDRESS,
                });
                state.apply(commands);
                CentralEvent::Connected {
                    conn_handle: LOOPBACK_CONN_HANDLE,
                    addr_type,
                    address,
                }
            } else {
                debug!("Loopback connection to {} rejected", address);
                CentralEvent::Connected {
                    conn_handle: INVALID_CONN_HANDLE,
                    addr_type,
                    address,
                }
            }
        };

        self.emit(event);
        Ok(())
    }

    async fn discover_services(&self, conn_handle: u16) -> Result<()> {
        let services = {
            let state = self.state.lock();
            state.require_connection(conn_handle)?;

            let mut services = vec![ServiceDescriptor {
                conn_handle,
                start_handle: GAP_SERVICE.0,
                end_handle: GAP_SERVICE.1,
                uuid: GENERIC_ACCESS_SERVICE_UUID,
            }];
            if !state.faults.hide_service {
                services.push(ServiceDescriptor {
                    conn_handle,
                    start_handle: RADON_SERVICE.0,
                    end_handle: RADON_SERVICE.1,
                    uuid: RADON_SERVICE_UUID,
                });
            }
            services
        };

        for service in services {
            self.emit(CentralEvent::ServiceResult(service));
        }
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        conn_handle: u16,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<()> {
        let found: Vec<CharacteristicDescriptor> = {
            let state = self.state.lock();
            state.require_connection(conn_handle)?;

            state
                .characteristics
                .iter()
                .filter(|c| (start_handle..=end_handle).contains(&c.def_handle))
                .filter(|c| !(state.faults.hide_service && c.service == RADON_SERVICE_UUID))
                .map(|c| CharacteristicDescriptor {
                    conn_handle,
                    def_handle: c.def_handle,
                    value_handle: c.value_handle,
                    properties: c.properties,
                    uuid: c.uuid,
                })
                .collect()
        };

        for characteristic in found {
            self.emit(CentralEvent::CharacteristicResult(characteristic));
        }
        Ok(())
    }

    async fn write(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<()> {
        let status = {
            let mut state = self.state.lock();
            state.require_connection(conn_handle)?;
            if state.faults.refuse_writes {
                return Err(Error::BluetoothUnavailable);
            }

            let writable = state
                .characteristics
                .iter()
                .find(|c| c.value_handle == value_handle)
                .map(|c| c.properties & PROP_WRITE != 0);

            match (state.faults.write_status, writable) {
                (Some(status), _) => status,
                (None, None) => ATT_INVALID_HANDLE,
                (None, Some(false)) => ATT_WRITE_NOT_PERMITTED,
                (None, Some(true)) => {
                    let value = Bytes::copy_from_slice(data);
                    state.attributes.insert(value_handle, value.clone());
                    let commands = state.emulator.handle(PeripheralEvent::Write {
                        conn_handle,
                        attr_handle: value_handle,
                        value,
                    });
                    state.apply(commands);
                    GATT_STATUS_SUCCESS
                }
            }
        };

        self.emit(CentralEvent::WriteStatus {
            conn_handle,
            value_handle,
            status,
        });
        Ok(())
    }

    async fn read(&self, conn_handle: u16, value_handle: u16) -> Result<()> {
        let data = {
            let state = self.state.lock();
            state.require_connection(conn_handle)?;
            if state.faults.refuse_reads {
                return Err(Error::BluetoothUnavailable);
            }

            let data = state
                .attributes
                .get(&value_handle)
                .cloned()
                .ok_or(Error::CharacteristicNotFound {
                    handle: value_handle,
                })?;

            if state.faults.drop_reads {
                debug!("Dropping read of {:#06x}", value_handle);
                return Ok(());
            }
            data
        };

        self.emit(CentralEvent::ReadResult {
            conn_handle,
            value_handle,
            data,
        });
        Ok(())
    }

    async fn disconnect(&self, conn_handle: u16) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.require_connection(conn_handle)?;
            state.connection = None;

            let commands = state.emulator.handle(PeripheralEvent::CentralDisconnected {
                conn_handle,
                addr_type: AddressType::Public,
                address: LOOPBACK_CENTRAL_ADDRESS,
            });
            state.apply(commands);
        }

        self.emit(CentralEvent::Disconnected {
            conn_handle,
            addr_type: AddressType::Public,
            address: self.address,
        });
        Ok(())
    }
}

impl<V: ValueSource> std::fmt::Debug for LoopbackLink<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoopbackLink")
            .field("address", &self.address)
            .field("emulator", &state.emulator)
            .field("connection", &state.connection)
            .field("faults", &state.faults)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::advertising::decode_name;
    use crate::ble::uuids::RADON_READOUT_UUID;
    use crate::protocol::reading;

    fn sensor() -> BdAddress {
        BdAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
    }

    fn link() -> (LoopbackLink<impl ValueSource>, mpsc::UnboundedReceiver<CentralEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (LoopbackLink::with_source(sensor(), || 0.25f32, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<CentralEvent>) -> Vec<CentralEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_advertises_emulator_name() {
        let (link, _rx) = link();
        let adv = link.advertising().unwrap();
        assert_eq!(decode_name(&adv).as_text(), Some(EMULATOR_LOCAL_NAME));
        assert_eq!(link.emulator_state(), PeripheralState::Advertising);
    }

    #[tokio::test]
    async fn test_connect_and_discover() {
        let (link, mut rx) = link();
        link.connect(AddressType::Random, sensor(), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![CentralEvent::Connected {
                conn_handle: LOOPBACK_CONN_HANDLE,
                addr_type: AddressType::Random,
                address: sensor(),
            }]
        );
        assert_eq!(link.emulator_state(), PeripheralState::Connected);
        assert!(link.advertising().is_none());

        link.discover_services(LOOPBACK_CONN_HANDLE).await.unwrap();
        let services = drain(&mut rx);
        assert_eq!(services.len(), 2);
        assert!(services.iter().any(|e| matches!(
            e,
            CentralEvent::ServiceResult(s) if s.uuid == RADON_SERVICE_UUID
        )));

        link.discover_characteristics(LOOPBACK_CONN_HANDLE, 0x0010, 0x0015)
            .await
            .unwrap();
        let uuids: Vec<Uuid> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                CentralEvent::CharacteristicResult(c) => Some(c.uuid),
                _ => None,
            })
            .collect();
        assert_eq!(uuids, vec![RADON_TRIGGER_UUID, RADON_READOUT_UUID]);
    }

    #[tokio::test]
    async fn test_wrong_address_rejected() {
        let (link, mut rx) = link();
        let other = BdAddress::new([1, 2, 3, 4, 5, 6]);
        link.connect(AddressType::Public, other, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [CentralEvent::Connected {
                conn_handle: INVALID_CONN_HANDLE,
                ..
            }]
        ));
        assert!(!link.is_connected());
    }

    #[tokio::test]
    async fn test_trigger_publishes_reading() {
        let (link, mut rx) = link();
        link.connect(AddressType::Random, sensor(), Duration::from_secs(2))
            .await
            .unwrap();
        link.write(LOOPBACK_CONN_HANDLE, TRIGGER_VALUE_HANDLE, &[0x50])
            .await
            .unwrap();
        link.read(LOOPBACK_CONN_HANDLE, READOUT_VALUE_HANDLE)
            .await
            .unwrap();

        let events = drain(&mut rx);
        assert_eq!(
            events[1],
            CentralEvent::WriteStatus {
                conn_handle: LOOPBACK_CONN_HANDLE,
                value_handle: TRIGGER_VALUE_HANDLE,
                status: GATT_STATUS_SUCCESS,
            }
        );
        match &events[2] {
            CentralEvent::ReadResult { data, .. } => {
                assert_eq!(data[..], reading::encode(0.25));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(link.attribute(TRIGGER_VALUE_HANDLE).unwrap()[..], [0x00]);
        assert_eq!(link.last_value(), Some(0.25));
    }

    #[tokio::test]
    async fn test_write_to_readout_not_permitted() {
        let (link, mut rx) = link();
        link.connect(AddressType::Random, sensor(), Duration::from_secs(2))
            .await
            .unwrap();
        link.write(LOOPBACK_CONN_HANDLE, READOUT_VALUE_HANDLE, &[0x50])
            .await
            .unwrap();
        assert!(drain(&mut rx).contains(&CentralEvent::WriteStatus {
            conn_handle: LOOPBACK_CONN_HANDLE,
            value_handle: READOUT_VALUE_HANDLE,
            status: ATT_WRITE_NOT_PERMITTED,
        }));
    }

    #[tokio::test]
    async fn test_disconnect_resumes_advertising() {
        let (link, mut rx) = link();
        link.connect(AddressType::Random, sensor(), Duration::from_secs(2))
            .await
            .unwrap();
        link.disconnect(LOOPBACK_CONN_HANDLE).await.unwrap();

        assert!(matches!(
            drain(&mut rx).last(),
            Some(CentralEvent::Disconnected {
                conn_handle: LOOPBACK_CONN_HANDLE,
                ..
            })
        ));
        assert_eq!(link.emulator_state(), PeripheralState::Advertising);
        assert!(link.advertising().is_some());

        assert!(matches!(
            link.disconnect(LOOPBACK_CONN_HANDLE).await,
            Err(Error::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_faults() {
        let (link, mut rx) = link();
        link.set_faults(LoopbackFaults {
            hide_service: true,
            drop_reads: true,
            write_status: Some(0x0E),
            ..Default::default()
        });
        link.connect(AddressType::Random, sensor(), Duration::from_secs(2))
            .await
            .unwrap();
        drain(&mut rx);

        link.discover_services(LOOPBACK_CONN_HANDLE).await.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);

        link.write(LOOPBACK_CONN_HANDLE, TRIGGER_VALUE_HANDLE, &[0x50])
            .await
            .unwrap();
        assert!(matches!(
            drain(&mut rx).as_slice(),
            [CentralEvent::WriteStatus { status: 0x0E, .. }]
        ));

        link.read(LOOPBACK_CONN_HANDLE, READOUT_VALUE_HANDLE)
            .await
            .unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_refused_requests_report_nothing() {
        let (link, mut rx) = link();
        link.set_faults(LoopbackFaults {
            refuse_writes: true,
            refuse_reads: true,
            ..Default::default()
        });
        link.connect(AddressType::Random, sensor(), Duration::from_secs(2))
            .await
            .unwrap();
        drain(&mut rx);

        assert!(matches!(
            link.write(LOOPBACK_CONN_HANDLE, TRIGGER_VALUE_HANDLE, &[0x50])
                .await,
            Err(Error::BluetoothUnavailable)
        ));
        assert!(matches!(
            link.read(LOOPBACK_CONN_HANDLE, READOUT_VALUE_HANDLE).await,
            Err(Error::BluetoothUnavailable)
        ));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(link.last_value(), None);
    }
}
