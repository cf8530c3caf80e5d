//! BLE scanning.
//!
//! Provides adapter selection, lookup of the sensor by address, and a debug
//! scan that lists every nearby device once.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::ble::address::{AddressType, BdAddress};
use crate::error::{Error, Result};

/// Interval at which known peripherals are polled while looking for one.
const FIND_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Get the first Bluetooth adapter of the host.
///
/// # Errors
///
/// Returns [`Error::BluetoothUnavailable`] if there is none.
pub async fn default_adapter() -> Result<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|_e| Error::BluetoothUnavailable)?;

    let adapter = manager
        .adapters()
        .await?
        .into_iter()
        .next()
        .ok_or(Error::BluetoothUnavailable)?;

    info!(
        "Using Bluetooth adapter: {:?}",
        adapter.adapter_info().await.ok()
    );

    Ok(adapter)
}

/// One device seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sighting {
    /// Device address.
    pub address: BdAddress,
    /// Address type, when the platform reports it.
    pub addr_type: Option<AddressType>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Advertised local name.
    pub name: Option<String>,
}

impl fmt::Display for Sighting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "addr {}", self.address)?;
        if let Some(addr_type) = self.addr_type {
            write!(f, " ({})", addr_type)?;
        }
        if let Some(rssi) = self.rssi {
            write!(f, " rssi {} dBm", rssi)?;
        }
        match &self.name {
            Some(name) => write!(f, " name {:?}", name),
            None => write!(f, " <no name>"),
        }
    }
}

/// Remembers which devices a scan has already reported.
#[derive(Debug, Clone, Default)]
pub struct ScanLog {
    seen: HashSet<BdAddress>,
}

impl ScanLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting. Returns `true` the first time `address` is seen.
    pub fn record(&mut self, address: BdAddress) -> bool {
        self.seen.insert(address)
    }

    /// Forget all sightings, at the end of a scan.
    pub fn reset(&mut self) {
        self.seen.clear();
    }

    /// Number of distinct devices seen.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Check if nothing was seen.
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Debug scanner listing nearby devices.
pub struct BleScanner {
    adapter: Adapter,
    log: Arc<RwLock<ScanLog>>,
}

impl BleScanner {
    /// Create a scanner on the default adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Ok(Self::with_adapter(default_adapter().await?))
    }

    /// Create a scanner on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            log: Arc::new(RwLock::new(ScanLog::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Scan for `duration`, logging each device the first time it is seen.
    ///
    /// Returns the devices in the order they were first seen.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<Sighting>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        info!("Scanning for {:?}", duration);

        let deadline = Instant::now() + duration;
        let mut sightings = Vec::new();

        loop {
            let event = match tokio::time::timeout_at(deadline, events.next()).await {
                Ok(Some(event)) => event,
                Ok(None) | Err(_) => break,
            };

            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                other => {
                    trace!("Ignoring adapter event {:?}", other);
                    continue;
                }
            };

            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                continue;
            };
            if let Some(sighting) = self.sighting(&peripheral).await {
                if self.log.write().record(sighting.address) {
                    info!("Scan result: {}", sighting);
                    sightings.push(sighting);
                }
            }
        }

        self.adapter.stop_scan().await?;
        self.log.write().reset();
        info!("Scan complete, {} devices", sightings.len());

        Ok(sightings)
    }

    async fn sighting(&self, peripheral: &Peripheral) -> Option<Sighting> {
        let properties = peripheral.properties().await.ok()??;

        Some(Sighting {
            address: BdAddress::from(properties.address),
            addr_type: properties.address_type.map(AddressType::from),
            rssi: properties.rssi,
            name: properties.local_name,
        })
    }
}

impl fmt::Debug for BleScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BleScanner")
            .field("seen", &self.log.read().len())
            .finish()
    }
}

/// Look up the peripheral with `address`, scanning for it up to `timeout`.
///
/// # Errors
///
/// Returns [`Error::ConnectionFailed`] if the device was not seen in time.
pub async fn find_peripheral(
    adapter: &Adapter,
    address: BdAddress,
    timeout: Duration,
) -> Result<Peripheral> {
    if let Some(peripheral) = known_peripheral(adapter, address).await? {
        return Ok(peripheral);
    }

    debug!("{} not known yet, scanning for it", address);
    adapter.start_scan(ScanFilter::default()).await?;

    let deadline = Instant::now() + timeout;
    let found = loop {
        if let Some(peripheral) = known_peripheral(adapter, address).await? {
            break Some(peripheral);
        }
        if Instant::now() >= deadline {
            break None;
        }
        tokio::time::sleep(FIND_POLL_INTERVAL).await;
    };

    if let Err(e) = adapter.stop_scan().await {
        debug!("Failed to stop scan: {}", e);
    }

    found.ok_or_else(|| Error::ConnectionFailed {
        reason: format!("{} not found within {:?}", address, timeout),
    })
}

async fn known_peripheral(adapter: &Adapter, address: BdAddress) -> Result<Option<Peripheral>> {
    let peripherals = adapter.peripherals().await?;
    Ok(peripherals
        .into_iter()
        .find(|p| BdAddress::from(p.address()) == address))
}
