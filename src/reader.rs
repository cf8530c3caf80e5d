//! Async driver for the central role.
//!
//! [`RadonReader`] owns a [`GattCentral`] on a single task. It feeds the
//! machine one event at a time from an unbounded channel, executes the
//! returned commands against a [`CentralLink`], and schedules the machine's
//! continuations as timer tasks that post back into the same channel. A
//! finished reading is handed to a [`ForwardingSink`].
//!
//! # Example
//!
//! ```no_run
//! use radoneye_ble::{
//!     event_channel, AddressType, BdAddress, LogSink, LoopbackLink, RadonReader,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> radoneye_ble::Result<()> {
//! let sensor: BdAddress = "AA:BB:CC:DD:EE:FF".parse()?;
//! let (tx, rx) = event_channel();
//! let link = Arc::new(LoopbackLink::new(sensor, tx.clone()));
//!
//! let mut reader = RadonReader::new(link, Arc::new(LogSink), (tx, rx), sensor, AddressType::Random);
//! let report = reader.run_cycle().await?;
//! println!("{:?}", report.reading);
//! # Ok(())
//! # }
//! ```

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::ble::address::{AddressType, BdAddress};
use crate::config::NetworkCredentials;
use crate::connectivity::ConnectivityProvider;
use crate::error::{Error, Result};
use crate::forward::ForwardingSink;
use crate::gatt::central::{CentralState, CentralTimings, CycleFailure, GattCentral};
use crate::gatt::events::{
    CentralCommand, CentralEvent, ATT_UNLIKELY_ERROR, INVALID_CONN_HANDLE,
};
use crate::gatt::link::CentralLink;
use crate::protocol::SensorReading;
use crate::watchdog::ConnectionWatchdog;

/// Sending half of the central event channel.
pub type EventSender = mpsc::UnboundedSender<CentralEvent>;
/// Receiving half of the central event channel.
pub type EventReceiver = mpsc::UnboundedReceiver<CentralEvent>;

/// Create the channel that carries radio and timer events to the reader.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Slack added on top of the worst-case cycle duration before a cycle is
/// abandoned.
const CYCLE_GRACE: Duration = Duration::from_secs(5);

/// Deadline used when the configured timings do not fit in an [`Instant`].
const MAX_CYCLE_DEADLINE: Duration = Duration::from_secs(24 * 3600);

/// Outcome of one readout cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// The reading, if the sensor produced one.
    pub reading: Option<SensorReading>,
    /// Whether the reading was accepted by the sink.
    pub forwarded: bool,
    /// Why no reading was produced, if known.
    pub failure: Option<CycleFailure>,
    /// State of the central machine when the cycle ended.
    pub state: CentralState,
}

impl CycleReport {
    /// Check if the cycle produced a reading.
    pub fn is_success(&self) -> bool {
        self.reading.is_some()
    }
}

/// Snapshot of the reader for observers on other tasks.
#[derive(Debug, Clone, Default)]
pub struct ReaderStatus {
    /// Current central state.
    pub state: CentralState,
    /// Most recent reading.
    pub last_reading: Option<SensorReading>,
    /// Failure of the most recent cycle.
    pub last_failure: Option<CycleFailure>,
    /// Number of cycles started.
    pub cycles: u64,
    /// Number of readings accepted by the sink.
    pub forwarded: u64,
}

/// Periodic radon reader.
pub struct RadonReader<L: CentralLink, S: ForwardingSink> {
    link: Arc<L>,
    sink: Arc<S>,
    address: BdAddress,
    addr_type: AddressType,
    central: GattCentral,
    events_tx: EventSender,
    events_rx: EventReceiver,
    watchdog: ConnectionWatchdog,
    status: Arc<RwLock<ReaderStatus>>,
}

impl<L: CentralLink + 'static, S: ForwardingSink> RadonReader<L, S> {
    /// Create a reader for the sensor at `address`.
    ///
    /// `events` must be the channel whose sender the link reports to.
    pub fn new(
        link: Arc<L>,
        sink: Arc<S>,
        events: (EventSender, EventReceiver),
        address: BdAddress,
        addr_type: AddressType,
    ) -> Self {
        let (events_tx, events_rx) = events;
        Self {
            link,
            sink,
            address,
            addr_type,
            central: GattCentral::default(),
            events_tx,
            events_rx,
            watchdog: ConnectionWatchdog::new(),
            status: Arc::new(RwLock::new(ReaderStatus::default())),
        }
    }

    /// Use custom cycle timings.
    pub fn with_timings(mut self, timings: CentralTimings) -> Self {
        self.central = GattCentral::new(timings);
        self
    }

    /// The sensor address.
    pub fn address(&self) -> BdAddress {
        self.address
    }

    /// Current central state.
    pub fn state(&self) -> CentralState {
        self.central.state()
    }

    /// Snapshot of the reader status.
    pub fn status(&self) -> ReaderStatus {
        self.status.read().clone()
    }

    /// Shared handle to the reader status, for observers on other tasks.
    pub fn status_handle(&self) -> Arc<RwLock<ReaderStatus>> {
        self.status.clone()
    }

    /// Upper bound on the duration of one cycle.
    pub fn cycle_deadline(&self) -> Duration {
        let timings = self.central.timings();
        timings
            .connect_timeout
            .saturating_add(timings.watchdog_timeout)
            .saturating_add(timings.settle_delay.saturating_mul(2))
            .saturating_add(CYCLE_GRACE)
    }

    /// Run one readout cycle: connect, trigger, read, disconnect, forward.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionBusy`] if a cycle is still running, or
    /// [`Error::Timeout`] if the link stopped reporting events and the
    /// cycle was abandoned.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let commands = self.central.begin(self.address, self.addr_type)?;
        self.status.write().cycles += 1;
        self.publish_state();

        let now = Instant::now();
        let deadline = now
            .checked_add(self.cycle_deadline())
            .unwrap_or_else(|| now + MAX_CYCLE_DEADLINE);
        let mut reading = None;
        let mut forwarded = false;

        self.execute(commands, &mut reading, &mut forwarded).await;

        while !self.central.state().is_finished() {
            let event = match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    self.abandon();
                    return Err(Error::Internal("event channel closed".to_string()));
                }
                Err(_) => {
                    error!("Readout cycle did not finish in time, abandoning it");
                    self.abandon();
                    return Err(Error::Timeout);
                }
            };

            trace!("Central event: {}", event.kind());
            let commands = self.central.handle(event);
            self.publish_state();
            self.execute(commands, &mut reading, &mut forwarded).await;
        }

        self.watchdog.disarm();

        let report = CycleReport {
            reading,
            forwarded,
            failure: self.central.last_failure(),
            state: self.central.state(),
        };

        {
            let mut status = self.status.write();
            status.last_failure = report.failure;
            if let Some(reading) = &report.reading {
                status.last_reading = Some(reading.clone());
            }
            if report.forwarded {
                status.forwarded += 1;
            }
        }

        match (&report.reading, report.failure) {
            (Some(reading), _) => info!("Readout cycle finished: {}", reading),
            (None, Some(failure)) => warn!("Readout cycle failed: {}", failure),
            (None, None) => warn!("Readout cycle ended without a reading"),
        }

        Ok(report)
    }

    /// Run readout cycles forever, one per `poll_interval`.
    ///
    /// Each cycle first makes sure the uplink is usable; a cycle is skipped
    /// when it is not. Failed cycles are logged and the schedule continues.
    pub async fn run<C: ConnectivityProvider + ?Sized>(
        &mut self,
        connectivity: &C,
        credentials: &NetworkCredentials,
        poll_interval: Duration,
        connect_timeout: Duration,
    ) {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Reading {} every {:?}", self.address, poll_interval);

        loop {
            interval.tick().await;

            if !connectivity.connect(credentials, connect_timeout).await {
                warn!("No uplink, skipping readout cycle");
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                warn!("Readout cycle error: {}", e);
            }
        }
    }

    async fn execute(
        &mut self,
        commands: Vec<CentralCommand>,
        reading: &mut Option<SensorReading>,
        forwarded: &mut bool,
    ) {
        for command in commands {
            match command {
                CentralCommand::Connect {
                    addr_type,
                    address,
                    timeout,
                } => {
                    if let Err(e) = self.link.connect(addr_type, address, timeout).await {
                        warn!("Connection request to {} failed: {}", address, e);
                        self.post(CentralEvent::Disconnected {
                            conn_handle: INVALID_CONN_HANDLE,
                            addr_type,
                            address,
                        });
                    }
                }
                CentralCommand::DiscoverServices { conn_handle } => {
                    if let Err(e) = self.link.discover_services(conn_handle).await {
                        warn!("Service discovery request failed: {}", e);
                    }
                }
                CentralCommand::DiscoverCharacteristics {
                    conn_handle,
                    start_handle,
                    end_handle,
                } => {
                    if let Err(e) = self
                        .link
                        .discover_characteristics(conn_handle, start_handle, end_handle)
                        .await
                    {
                        warn!("Characteristic discovery request failed: {}", e);
                    }
                }
                CentralCommand::Write {
                    conn_handle,
                    value_handle,
                    data,
                } => {
                    if let Err(e) = self.link.write(conn_handle, value_handle, &data).await {
                        warn!("Write request failed: {}", e);
                        self.post(CentralEvent::WriteStatus {
                            conn_handle,
                            value_handle,
                            status: ATT_UNLIKELY_ERROR,
                        });
                    }
                }
                CentralCommand::Read {
                    conn_handle,
                    value_handle,
                } => {
                    if let Err(e) = self.link.read(conn_handle, value_handle).await {
                        warn!("Read request failed: {}", e);
                        self.post(CentralEvent::ReadFailed {
                            conn_handle,
                            value_handle,
                            status: ATT_UNLIKELY_ERROR,
                        });
                    }
                }
                CentralCommand::Disconnect { conn_handle } => {
                    if let Err(e) = self.link.disconnect(conn_handle).await {
                        // The link no longer knows the connection, so it is gone
                        warn!("Disconnect request failed: {}", e);
                        if let Some(session) = self
                            .central
                            .session()
                            .filter(|s| s.conn_handle == conn_handle)
                        {
                            let event = CentralEvent::Disconnected {
                                conn_handle,
                                addr_type: session.addr_type,
                                address: session.address,
                            };
                            self.post(event);
                        }
                    }
                }
                CentralCommand::ArmWatchdog { session, timeout } => {
                    self.watchdog.arm(session, timeout, self.events_tx.clone());
                }
                CentralCommand::Schedule { delay, event } => {
                    let tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = tx.send(event);
                    });
                }
                CentralCommand::Deliver(value) => {
                    match self.sink.deliver(&value).await {
                        Ok(()) => *forwarded = true,
                        Err(e) => error!("Forwarding reading failed: {}", e),
                    }
                    *reading = Some(value);
                }
            }
        }
    }

    fn post(&self, event: CentralEvent) {
        if self.events_tx.send(event).is_err() {
            debug!("Central event receiver dropped");
        }
    }

    fn publish_state(&self) {
        self.status.write().state = self.central.state();
    }

    fn abandon(&mut self) {
        self.watchdog.disarm();
        if let Some(session) = self.central.abandon() {
            let link = self.link.clone();
            let conn_handle = session.conn_handle;
            tokio::spawn(async move {
                if let Err(e) = link.disconnect(conn_handle).await {
                    debug!(
                        "Disconnect of abandoned connection {} failed: {}",
                        conn_handle, e
                    );
                }
            });
        }
        let mut status = self.status.write();
        status.state = self.central.state();
        status.last_failure = self.central.last_failure();
    }
}

impl<L: CentralLink, S: ForwardingSink> std::fmt::Debug for RadonReader<L, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RadonReader")
            .field("address", &self.address)
            .field("addr_type", &self.addr_type)
            .field("central", &self.central)
            .finish()
    }
}
