use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use clap::Parser;
use enterble::characteristic;
use enterble::{
    BluestTransport, DeviceScanner, DeviceSession, FlowtimeCollector, ScanFilter, SessionConfig,
    Uuid, WriteFailurePolicy,
};
use tracing_subscriber::EnvFilter;

/// Find a peripheral, print what it reports about itself and optionally
/// stream Flowtime data from it.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address or platform handle of the device to look for
    #[arg(long)]
    identity: Option<String>,

    /// Exact advertised name to look for
    #[arg(long)]
    name: Option<String>,

    /// Advertised service to look for, e.g. 0000ff10-1212-abcd-1523-785feabcd123
    /// for Flowtime headbands
    #[arg(long)]
    service: Option<Uuid>,

    /// Scan window in seconds
    #[arg(long, default_value_t = 10)]
    scan_secs: u64,

    /// Stream Flowtime notifications for this many seconds
    #[arg(long)]
    listen_secs: Option<u64>,

    /// Fail on rejected writes instead of logging them
    #[arg(long)]
    strict_writes: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut filter = ScanFilter::new();
    if let Some(identity) = &args.identity {
        filter = filter.identity(identity);
    }
    if let Some(name) = &args.name {
        filter = filter.name(name);
    }
    if let Some(service) = args.service {
        filter = filter.service(service);
    }
    let config = SessionConfig {
        write_failure_policy: if args.strict_writes {
            WriteFailurePolicy::Surface
        } else {
            WriteFailurePolicy::Log
        },
    };

    let transport = Arc::new(BluestTransport::new().await?);
    let scanner = DeviceScanner::new(transport)
        .with_window(Duration::from_secs(args.scan_secs))
        .with_session_config(config);
    let device = scanner
        .discover(&filter)
        .await?
        .into_iter()
        .next()
        .ok_or(anyhow!("No device found, please try again later."))?;

    print_info(&device).await?;

    if let Some(secs) = args.listen_secs {
        let (collector, mut events) = FlowtimeCollector::new(Arc::new(device));
        collector.start().await?;
        let deadline = tokio::time::sleep(Duration::from_secs(secs));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = events.recv() => match event {
                    Some(event) => println!("{event:?}"),
                    None => break,
                },
            }
        }
        collector.stop().await;
    } else {
        device.disconnect().await;
    }

    Ok(())
}

async fn print_info(device: &DeviceSession<BluestTransport>) -> anyhow::Result<()> {
    println!("Device:        {}", device.descriptor());
    println!("Name:          {:?}", device.name().await?);
    println!("Model:         {:?}", device.model().await?);
    println!("Manufacturer:  {:?}", device.manufacturer().await?);
    println!("Firmware:      {:?}", device.firmware_version().await?);
    println!("Hardware:      {:?}", device.hardware_version().await?);
    println!("Serial number: {:?}", device.serial_number().await?);
    println!("MAC address:   {:?}", device.mac_address().await?);
    println!("Conn. params:  {:?}", device.connection_parameters().await?);
    match device.soc().await? {
        Some(soc) => println!("SOC:           {}%", soc.calibrated_percentage),
        None => println!("SOC:           unavailable"),
    }
    println!("Characteristics:");
    for uuid in device.characteristics().await? {
        match characteristic::lookup(uuid) {
            Some(known) => println!("  {uuid} {:?} {:?}", known.kind, known.access),
            None => println!("  {uuid}"),
        }
    }
    Ok(())
}
