//! End-to-end readout cycles against the sensor emulator.

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use radoneye_ble::gatt::peripheral::{PeripheralState, ValueSource};
use radoneye_ble::{
    event_channel, AddressType, BdAddress, CentralState, CentralTimings, CycleFailure,
    ForwardingSink, LoopbackFaults, LoopbackLink, RadonReader, Result, SensorReading,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_test::assert_ok;

/// Sink that keeps every reading it receives.
#[derive(Default)]
struct RecordingSink {
    readings: Mutex<Vec<SensorReading>>,
}

#[async_trait]
impl ForwardingSink for RecordingSink {
    async fn deliver(&self, reading: &SensorReading) -> Result<()> {
        self.readings.lock().push(reading.clone());
        Ok(())
    }
}

/// Emulator values taken from a fixed sequence.
struct Sequence(Vec<f32>);

impl ValueSource for Sequence {
    fn next_value(&mut self) -> f32 {
        self.0.remove(0)
    }
}

fn sensor() -> BdAddress {
    BdAddress::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55])
}

struct Harness {
    reader: RadonReader<LoopbackLink<Sequence>, RecordingSink>,
    link: Arc<LoopbackLink<Sequence>>,
    sink: Arc<RecordingSink>,
}

fn harness(values: Vec<f32>, faults: LoopbackFaults) -> Harness {
    let (tx, rx) = event_channel();
    let link = Arc::new(LoopbackLink::with_source(sensor(), Sequence(values), tx.clone()));
    link.set_faults(faults);
    let sink = Arc::new(RecordingSink::default());
    let reader = RadonReader::new(
        link.clone(),
        sink.clone(),
        (tx, rx),
        sensor(),
        AddressType::Random,
    );
    Harness { reader, link, sink }
}

#[tokio::test(start_paused = true)]
async fn test_cycle_forwards_simulated_value_times_37() {
    let mut h = harness(vec![0.25, 0.75], LoopbackFaults::default());

    let first = assert_ok!(h.reader.run_cycle().await);
    let second = assert_ok!(h.reader.run_cycle().await);

    assert!(first.forwarded && second.forwarded);
    let values: Vec<f32> = h.sink.readings.lock().iter().map(|r| r.value).collect();
    assert_eq!(values, vec![0.25 * 37.0, 0.75 * 37.0]);

    assert_eq!(h.link.emulator_state(), PeripheralState::Advertising);
    assert!(h.link.advertising().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_cycle_respects_settle_delays() {
    let mut h = harness(vec![0.5], LoopbackFaults::default());

    let started = Instant::now();
    assert_ok!(h.reader.run_cycle().await);

    // One settle before characteristic discovery, one before the trigger
    assert!(started.elapsed() >= CentralTimings::DEFAULT_SETTLE_DELAY * 2);
    assert!(started.elapsed() < CentralTimings::DEFAULT_WATCHDOG_TIMEOUT);
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_resolves_dropped_read() {
    let faults = LoopbackFaults {
        drop_reads: true,
        ..Default::default()
    };
    let mut h = harness(vec![0.5], faults);

    let report = assert_ok!(h.reader.run_cycle().await);

    assert_eq!(report.reading, None);
    assert_eq!(report.failure, Some(CycleFailure::WatchdogExpired));
    assert_eq!(report.state, CentralState::Done);
    assert!(!h.link.is_connected());
    assert!(h.sink.readings.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_write_failure_disconnects_once_without_delivery() {
    let faults = LoopbackFaults {
        write_status: Some(0x03),
        ..Default::default()
    };
    let mut h = harness(vec![0.5], faults);

    let started = Instant::now();
    let report = assert_ok!(h.reader.run_cycle().await);

    assert_eq!(report.failure, Some(CycleFailure::WriteRejected { status: 0x03 }));
    assert_eq!(report.state, CentralState::Done);
    assert!(h.sink.readings.lock().is_empty());
    // Closed right away, not by the watchdog
    assert!(started.elapsed() < CentralTimings::DEFAULT_WATCHDOG_TIMEOUT);
    assert_eq!(h.link.emulator_state(), PeripheralState::Advertising);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_connection_then_recovery() {
    let faults = LoopbackFaults {
        reject_connection: true,
        ..Default::default()
    };
    let mut h = harness(vec![0.1], faults);

    let report = assert_ok!(h.reader.run_cycle().await);
    assert_eq!(report.state, CentralState::Failed);
    assert_eq!(report.failure, Some(CycleFailure::ConnectionRejected));

    h.link.set_faults(LoopbackFaults::default());
    let report = assert_ok!(h.reader.run_cycle().await);
    assert!(report.is_success());
    assert_eq!(h.sink.readings.lock().len(), 1);
    assert_eq!(h.reader.status().cycles, 2);
}

#[tokio::test(start_paused = true)]
async fn test_custom_timings() {
    let faults = LoopbackFaults {
        hide_service: true,
        ..Default::default()
    };
    let Harness { reader, .. } = harness(Vec::new(), faults);
    let mut reader = reader.with_timings(CentralTimings {
        watchdog_timeout: Duration::from_secs(3),
        ..CentralTimings::default()
    });

    let started = Instant::now();
    let report = assert_ok!(reader.run_cycle().await);
    assert_eq!(report.failure, Some(CycleFailure::WatchdogExpired));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < CentralTimings::DEFAULT_WATCHDOG_TIMEOUT);
}
