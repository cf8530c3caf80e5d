//! [`CentralLink`] on the host Bluetooth adapter.
//!
//! btleplug works with UUIDs and characteristic objects, not ATT handles.
//! The link therefore lays out a synthetic attribute table per connection
//! after service discovery: every service gets a declaration handle, every
//! characteristic a definition handle followed by its value handle. The
//! handles are stable for the lifetime of the connection and map back to the
//! btleplug characteristics for reads and writes.
//!
//! Requests run on spawned tasks and report through the event channel, so
//! a slow controller never blocks the reader.

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent as AdapterEvent, Characteristic, Peripheral as _, WriteType,
};
use btleplug::platform::{Adapter, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::address::{AddressType, BdAddress};
use crate::ble::scanner::{self, find_peripheral};
use crate::error::{Error, Result};
use crate::gatt::events::{
    CentralEvent, CharacteristicDescriptor, ServiceDescriptor, ATT_UNLIKELY_ERROR,
    GATT_STATUS_SUCCESS, INVALID_CONN_HANDLE,
};
use crate::gatt::link::CentralLink;

/// First handle of the synthetic attribute table.
const FIRST_HANDLE: u16 = 0x0001;

/// First connection handle assigned by the link.
const FIRST_CONN_HANDLE: u16 = 0x0001;

/// A characteristic placed in the synthetic attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaidOutCharacteristic<T> {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Definition handle.
    pub def_handle: u16,
    /// Value handle (definition handle + 1).
    pub value_handle: u16,
    /// Property flags.
    pub properties: u8,
    /// Platform object for the characteristic.
    pub inner: T,
}

/// A service placed in the synthetic attribute table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaidOutService<T> {
    /// Service UUID.
    pub uuid: Uuid,
    /// Declaration handle.
    pub start_handle: u16,
    /// Last handle belonging to the service.
    pub end_handle: u16,
    /// Characteristics in handle order.
    pub characteristics: Vec<LaidOutCharacteristic<T>>,
}

/// Assign consecutive handles to services and their characteristics.
///
/// Each entry is a service UUID with its characteristics as
/// `(uuid, properties, inner)`.
pub fn lay_out<T>(services: Vec<(Uuid, Vec<(Uuid, u8, T)>)>) -> Vec<LaidOutService<T>> {
    let mut next = FIRST_HANDLE;
    let mut laid_out = Vec::with_capacity(services.len());

    for (uuid, characteristics) in services {
        let start_handle = next;
        next += 1;

        let characteristics = characteristics
            .into_iter()
            .map(|(uuid, properties, inner)| {
                let def_handle = next;
                next += 2;
                LaidOutCharacteristic {
                    uuid,
                    def_handle,
                    value_handle: def_handle + 1,
                    properties,
                    inner,
                }
            })
            .collect();

        laid_out.push(LaidOutService {
            uuid,
            start_handle,
            end_handle: next - 1,
            characteristics,
        });
    }

    laid_out
}

struct Connection {
    peripheral: Peripheral,
    address: BdAddress,
    addr_type: AddressType,
    services: Vec<LaidOutService<Characteristic>>,
}

impl Connection {
    fn characteristic(&self, value_handle: u16) -> Result<Characteristic> {
        self.services
            .iter()
            .flat_map(|s| s.characteristics.iter())
            .find(|c| c.value_handle == value_handle)
            .map(|c| c.inner.clone())
            .ok_or(Error::CharacteristicNotFound {
                handle: value_handle,
            })
    }
}

#[derive(Default)]
struct Connections {
    next_handle: u16,
    by_handle: HashMap<u16, Connection>,
}

/// Pick the first free connection handle at or after `next`, skipping the
/// invalid marker and wrapping around.
fn allocate_conn_handle(next: u16, in_use: impl Fn(u16) -> bool) -> u16 {
    let mut handle = next.max(FIRST_CONN_HANDLE);
    while handle == INVALID_CONN_HANDLE || in_use(handle) {
        handle = handle.wrapping_add(1).max(FIRST_CONN_HANDLE);
    }
    handle
}

impl Connections {
    fn insert(&mut self, connection: Connection) -> u16 {
        let handle = allocate_conn_handle(self.next_handle, |h| self.by_handle.contains_key(&h));
        self.next_handle = handle.wrapping_add(1);
        self.by_handle.insert(handle, connection);
        handle
    }

    fn find_by_id(&self, id: &PeripheralId) -> Option<u16> {
        self.by_handle
            .iter()
            .find(|(_, c)| &c.peripheral.id() == id)
            .map(|(handle, _)| *handle)
    }
}

/// Central link on a btleplug adapter.
pub struct BtleplugLink {
    adapter: Adapter,
    events: mpsc::UnboundedSender<CentralEvent>,
    connections: Arc<Mutex<Connections>>,
    monitor: JoinHandle<()>,
}

impl BtleplugLink {
    /// Create a link on the default adapter.
    pub async fn new(events: mpsc::UnboundedSender<CentralEvent>) -> Result<Self> {
        let adapter = scanner::default_adapter().await?;
        Self::with_adapter(adapter, events).await
    }

    /// Create a link on a specific adapter.
    pub async fn with_adapter(
        adapter: Adapter,
        events: mpsc::UnboundedSender<CentralEvent>,
    ) -> Result<Self> {
        let connections = Arc::new(Mutex::new(Connections::default()));
        let adapter_events = adapter.events().await?;

        let monitor = {
            let connections = connections.clone();
            let events = events.clone();
            tokio::spawn(async move {
                let mut adapter_events = adapter_events;
                while let Some(event) = adapter_events.next().await {
                    if let AdapterEvent::DeviceDisconnected(id) = event {
                        Self::on_peripheral_disconnected(&connections, &events, &id);
                    }
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            events,
            connections,
            monitor,
        })
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().by_handle.len()
    }

    fn on_peripheral_disconnected(
        connections: &Mutex<Connections>,
        events: &mpsc::UnboundedSender<CentralEvent>,
        id: &PeripheralId,
    ) {
        let removed = {
            let mut connections = connections.lock();
            connections
                .find_by_id(id)
                .and_then(|handle| connections.by_handle.remove(&handle).map(|c| (handle, c)))
        };

        if let Some((conn_handle, connection)) = removed {
            info!("{} disconnected (conn {})", connection.address, conn_handle);
            let _ = events.send(CentralEvent::Disconnected {
                conn_handle,
                addr_type: connection.addr_type,
                address: connection.address,
            });
        }
    }

    fn peripheral(&self, conn_handle: u16) -> Result<Peripheral> {
        self.connections
            .lock()
            .by_handle
            .get(&conn_handle)
            .map(|c| c.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    fn characteristic(
        &self,
        conn_handle: u16,
        value_handle: u16,
    ) -> Result<(Peripheral, Characteristic)> {
        let connections = self.connections.lock();
        let connection = connections
            .by_handle
            .get(&conn_handle)
            .ok_or(Error::NotConnected)?;
        Ok((
            connection.peripheral.clone(),
            connection.characteristic(value_handle)?,
        ))
    }
}

#[async_trait]
impl CentralLink for BtleplugLink {
    async fn connect(
        &self,
        addr_type: AddressType,
        address: BdAddress,
        timeout: Duration,
    ) -> Result<()> {
        let adapter = self.adapter.clone();
        let connections = self.connections.clone();
        let events = self.events.clone();

        debug!(
            "Connecting to {} (address type {} is resolved by the platform)",
            address, addr_type
        );

        tokio::spawn(async move {
            let attempt = async {
                let peripheral = find_peripheral(&adapter, address, timeout).await?;
                match tokio::time::timeout(timeout, peripheral.connect()).await {
                    Ok(result) => result?,
                    Err(_) => return Err(Error::Timeout),
                }
                Ok::<_, Error>(peripheral)
            };

            let event = match attempt.await {
                Ok(peripheral) => {
                    let conn_handle = connections.lock().insert(Connection {
                        peripheral,
                        address,
                        addr_type,
                        services: Vec::new(),
                    });
                    CentralEvent::Connected {
                        conn_handle,
                        addr_type,
                        address,
                    }
                }
                Err(e) => {
                    warn!("Connection to {} failed: {}", address, e);
                    CentralEvent::Connected {
                        conn_handle: INVALID_CONN_HANDLE,
                        addr_type,
                        address,
                    }
                }
            };
            let _ = events.send(event);
        });

        Ok(())
    }

    async fn discover_services(&self, conn_handle: u16) -> Result<()> {
        let peripheral = self.peripheral(conn_handle)?;
        let connections = self.connections.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                error!("Service discovery on conn {} failed: {}", conn_handle, e);
                return;
            }

            let services = lay_out(
                peripheral
                    .services()
                    .into_iter()
                    .filter(|s| s.primary)
                    .map(|s| {
                        let characteristics = s
                            .characteristics
                            .into_iter()
                            .map(|c| (c.uuid, c.properties.bits(), c))
                            .collect();
                        (s.uuid, characteristics)
                    })
                    .collect(),
            );

            let descriptors: Vec<ServiceDescriptor> = services
                .iter()
                .map(|s| ServiceDescriptor {
                    conn_handle,
                    start_handle: s.start_handle,
                    end_handle: s.end_handle,
                    uuid: s.uuid,
                })
                .collect();

            match connections.lock().by_handle.get_mut(&conn_handle) {
                Some(connection) => connection.services = services,
                None => {
                    debug!("Conn {} closed during service discovery", conn_handle);
                    return;
                }
            }

            for descriptor in descriptors {
                trace!("Service {} at {:#06x}", descriptor.uuid, descriptor.start_handle);
                let _ = events.send(CentralEvent::ServiceResult(descriptor));
            }
        });

        Ok(())
    }

    async fn discover_characteristics(
        &self,
        conn_handle: u16,
        start_handle: u16,
        end_handle: u16,
    ) -> Result<()> {
        let found: Vec<CharacteristicDescriptor> = {
            let connections = self.connections.lock();
            let connection = connections
                .by_handle
                .get(&conn_handle)
                .ok_or(Error::NotConnected)?;

            connection
                .services
                .iter()
                .flat_map(|s| s.characteristics.iter())
                .filter(|c| (start_handle..=end_handle).contains(&c.def_handle))
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
            let _ = self
                .events
                .send(CentralEvent::CharacteristicResult(characteristic));
        }
        Ok(())
    }

    async fn write(&self, conn_handle: u16, value_handle: u16, data: &[u8]) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(conn_handle, value_handle)?;
        let events = self.events.clone();
        let data = data.to_vec();

        tokio::spawn(async move {
            let status = match peripheral
                .write(&characteristic, &data, WriteType::WithResponse)
                .await
            {
                Ok(()) => GATT_STATUS_SUCCESS,
                Err(e) => {
                    warn!("Write to {:#06x} failed: {}", value_handle, e);
                    ATT_UNLIKELY_ERROR
                }
            };
            let _ = events.send(CentralEvent::WriteStatus {
                conn_handle,
                value_handle,
                status,
            });
        });

        Ok(())
    }

    async fn read(&self, conn_handle: u16, value_handle: u16) -> Result<()> {
        let (peripheral, characteristic) = self.characteristic(conn_handle, value_handle)?;
        let events = self.events.clone();

        tokio::spawn(async move {
            match peripheral.read(&characteristic).await {
                Ok(data) => {
                    let _ = events.send(CentralEvent::ReadResult {
                        conn_handle,
                        value_handle,
                        data: Bytes::from(data),
                    });
                }
                Err(e) => {
                    error!("Read of {:#06x} failed: {}", value_handle, e);
                    let _ = events.send(CentralEvent::ReadFailed {
                        conn_handle,
                        value_handle,
                        status: ATT_UNLIKELY_ERROR,
                    });
                }
            }
        });

        Ok(())
    }

    async fn disconnect(&self, conn_handle: u16) -> Result<()> {
        let connection = self
            .connections
            .lock()
            .by_handle
            .remove(&conn_handle)
            .ok_or(Error::NotConnected)?;
        let events = self.events.clone();

        tokio::spawn(async move {
            if let Err(e) = connection.peripheral.disconnect().await {
                warn!("Disconnect of conn {} failed: {}", conn_handle, e);
            }
            let _ = events.send(CentralEvent::Disconnected {
                conn_handle,
                addr_type: connection.addr_type,
                address: connection.address,
            });
        });

        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{
        DEVICE_NAME_UUID, GENERIC_ACCESS_SERVICE_UUID, RADON_READOUT_UUID, RADON_SERVICE_UUID,
        RADON_TRIGGER_UUID,
    };
    use pretty_assertions::assert_eq;

    #[test]
    fn test_lay_out_assigns_consecutive_handles() {
        let services = lay_out(vec![
            (GENERIC_ACCESS_SERVICE_UUID, vec![(DEVICE_NAME_UUID, 0x02, ())]),
            (
                RADON_SERVICE_UUID,
                vec![(RADON_TRIGGER_UUID, 0x08, ()), (RADON_READOUT_UUID, 0x02, ())],
            ),
        ]);

        assert_eq!(services[0].start_handle, 0x0001);
        assert_eq!(services[0].end_handle, 0x0003);
        assert_eq!(services[0].characteristics[0].value_handle, 0x0003);

        let radon = &services[1];
        assert_eq!(radon.start_handle, 0x0004);
        assert_eq!(radon.end_handle, 0x0008);
        assert_eq!(
            radon
                .characteristics
                .iter()
                .map(|c| (c.def_handle, c.value_handle))
                .collect::<Vec<_>>(),
            vec![(0x0005, 0x0006), (0x0007, 0x0008)]
        );
    }

    #[test]
    fn test_lay_out_empty_service() {
        let services = lay_out::<()>(vec![(RADON_SERVICE_UUID, Vec::new())]);
        assert_eq!(services[0].start_handle, services[0].end_handle);
    }

    #[test]
    fn test_conn_handle_allocation() {
        assert_eq!(allocate_conn_handle(0, |_| false), 0x0001);
        assert_eq!(allocate_conn_handle(0x0005, |h| h == 0x0005), 0x0006);
        assert_eq!(allocate_conn_handle(INVALID_CONN_HANDLE, |_| false), 0x0001);
        assert_eq!(allocate_conn_handle(0xFFFE, |h| h == 0xFFFE), 0x0001);
    }
}
