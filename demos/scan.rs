//! Find CozyLife devices by broadcast discovery or by probing addresses.
//!
//! Run with: cargo run --example scan -- --help

use std::time::Duration;

use clap::{Parser, Subcommand};
use cozylife_local::{DiscoveryConfig, discover_devices, scan};

#[derive(Parser)]
#[command(name = "cozylife-scan")]
#[command(about = "Find CozyLife devices on the local network", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Broadcast an INFO probe on UDP port 6095 and list the replies
    Discover {
        /// How long to collect replies, in seconds
        #[arg(short, long, default_value = "5")]
        timeout: u64,
    },

    /// Probe TCP port 5555 on every address of one or more targets
    Probe {
        /// A single address, a range (a.b.c.d-e.f.g.h) or a CIDR block
        #[arg(required = true)]
        targets: Vec<String>,

        /// Probes in flight at once
        #[arg(short, long, default_value = "50")]
        concurrency: usize,

        /// Per-address timeout, in seconds
        #[arg(short, long, default_value = "2")]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let devices = match cli.command {
        Commands::Discover { timeout } => {
            println!("Broadcasting for {timeout}s...");
            discover_devices(&DiscoveryConfig::default(), Duration::from_secs(timeout)).await?
        }
        Commands::Probe {
            targets,
            concurrency,
            timeout,
        } => {
            let mut ips = Vec::new();
            for target in &targets {
                ips.extend(scan::expand_targets(target)?);
            }
            println!("Probing {} addresses...", ips.len());
            scan::scan(ips, concurrency, Duration::from_secs(timeout)).await
        }
    };

    if devices.is_empty() {
        println!("No devices found.");
        return Ok(());
    }

    println!("Found {} device(s):", devices.len());
    for device in &devices {
        println!(
            "  - {:<16} {:<22} {:<16} {}",
            device.ip(),
            device.serial(),
            device
                .device_type()
                .map_or("unknown".to_string(), |t| t.name().to_string()),
            device.product_id().unwrap_or("-"),
        );
    }
    Ok(())
}
