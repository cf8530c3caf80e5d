//! Loopback example: run readout cycles against the sensor emulator
//!
//! Run with: cargo run --example loopback

use radoneye_ble::{
    event_channel, AddressType, BdAddress, CentralTimings, LogSink, LoopbackFaults, LoopbackLink,
    RadonReader, Result,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("radoneye_ble=debug")),
        )
        .init();

    let sensor: BdAddress = "AA:BB:CC:DD:EE:FF".parse()?;
    let (tx, rx) = event_channel();
    let link = Arc::new(LoopbackLink::new(sensor, tx.clone()));

    let timings = CentralTimings {
        settle_delay: Duration::from_millis(50),
        watchdog_timeout: Duration::from_secs(2),
        ..CentralTimings::default()
    };
    let mut reader = RadonReader::new(
        link.clone(),
        Arc::new(LogSink),
        (tx, rx),
        sensor,
        AddressType::Random,
    )
    .with_timings(timings);

    println!("Reading the emulated sensor three times...\n");

    for cycle in 1..=3 {
        let report = reader.run_cycle().await?;
        match &report.reading {
            Some(reading) => println!(
                "Cycle {}: {} (emulator published {:?})",
                cycle,
                reading,
                link.last_value()
            ),
            None => println!("Cycle {}: no reading ({:?})", cycle, report.failure),
        }
    }

    println!("\nHiding the radon service; the watchdog ends the next cycle...");
    link.set_faults(LoopbackFaults {
        hide_service: true,
        ..Default::default()
    });
    let report = reader.run_cycle().await?;
    println!("Result: {:?} in state {}", report.failure, report.state);

    Ok(())
}
