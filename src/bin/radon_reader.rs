//! RadonEye reader daemon.
//!
//! Run with: cargo run --bin radon-reader -- run --config config.json

use clap::{Parser, Subcommand};
use radoneye_ble::{
    event_channel, AddressType, AlwaysOnline, BdAddress, BleScanner, BtleplugLink,
    ConnectivityProvider, ForwardingSink, HomematicSink, LogSink, RadonReader, ReaderConfig,
    Result, TcpReachability,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "radon-reader", version, about = "Periodic RadonEye readout with HomeMatic forwarding")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read the sensor periodically and forward each reading
    Run {
        /// Configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
        /// Log readings instead of forwarding them
        #[arg(long)]
        dry_run: bool,
    },
    /// Read the sensor once and print the reading
    Once {
        /// Configuration file
        #[arg(short, long, default_value = "config.json")]
        config: PathBuf,
        /// Forward the reading as well
        #[arg(long)]
        forward: bool,
    },
    /// List nearby devices
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "10")]
        seconds: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config, dry_run } => {
            let config = ReaderConfig::load(&config)?;
            if dry_run {
                run(&config, LogSink).await
            } else {
                let sink = HomematicSink::new(&config.homematic_addr, &config.homematic_ise_id)?;
                run(&config, sink).await
            }
        }
        Commands::Once { config, forward } => {
            let config = ReaderConfig::load(&config)?;
            if forward {
                let sink = HomematicSink::new(&config.homematic_addr, &config.homematic_ise_id)?;
                once(&config, sink).await
            } else {
                once(&config, LogSink).await
            }
        }
        Commands::Scan { seconds } => {
            let scanner = BleScanner::new().await?;
            let sightings = scanner.scan(Duration::from_secs(seconds)).await?;
            println!("{} devices found", sightings.len());
            for sighting in sightings {
                println!("  {}", sighting);
            }
            Ok(())
        }
    }
}

async fn reader<S: ForwardingSink>(
    config: &ReaderConfig,
    sink: S,
) -> Result<RadonReader<BtleplugLink, S>> {
    let address: BdAddress = config.address()?;
    let addr_type: AddressType = config.address_type()?;

    let (tx, rx) = event_channel();
    let link = Arc::new(BtleplugLink::new(tx.clone()).await?);

    Ok(
        RadonReader::new(link, Arc::new(sink), (tx, rx), address, addr_type)
            .with_timings(config.timings()),
    )
}

async fn run<S: ForwardingSink>(config: &ReaderConfig, sink: S) -> Result<()> {
    let mut reader = reader(config, sink).await?;

    let connectivity: Box<dyn ConnectivityProvider> =
        match TcpReachability::from_url(&config.homematic_addr) {
            Some(provider) => Box::new(provider),
            None => {
                warn!("Cannot derive uplink target from homematic_addr, skipping checks");
                Box::new(AlwaysOnline)
            }
        };

    if !connectivity
        .connect(&config.network, config.wifi_timeout())
        .await
    {
        warn!("Uplink not available yet, continuing");
    }

    let reset = async {
        match config.reset_interval() {
            Some(interval) => tokio::time::sleep(interval).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = reader.run(
            connectivity.as_ref(),
            &config.network,
            config.poll_interval(),
            config.wifi_timeout(),
        ) => {}
        _ = reset => {
            info!("Reset timer elapsed, exiting for restart");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }

    Ok(())
}

async fn once<S: ForwardingSink>(config: &ReaderConfig, sink: S) -> Result<()> {
    let mut reader = reader(config, sink).await?;
    let report = reader.run_cycle().await?;

    match (&report.reading, report.failure) {
        (Some(reading), _) => println!(
            "{} (raw {}, taken {})",
            reading,
            reading.raw_value,
            reading.taken_at.to_rfc3339()
        ),
        (None, Some(failure)) => {
            println!("No reading: {}", failure);
            return Err(failure.into());
        }
        (None, None) => println!("No reading (state {})", report.state),
    }

    Ok(())
}
