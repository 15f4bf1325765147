//! Watch an energy storage unit and toggle one of its outputs.
//!
//! Run with: cargo run --example energy_outputs -- 192.168.1.60 <serial> ac on

use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use cozylife_local::{
    DeviceDescriptor, DeviceType, EnergyStorage, Output, SessionConfig, SessionPool,
};

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Ac,
    Led,
    Dc,
}

impl From<Target> for Output {
    fn from(target: Target) -> Self {
        match target {
            Target::Ac => Output::Ac,
            Target::Led => Output::Led,
            Target::Dc => Output::Dc12v,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Switch {
    On,
    Off,
}

#[derive(Parser)]
#[command(about = "Toggle an output of a CozyLife energy storage unit", long_about = None)]
struct Cli {
    ip: Ipv4Addr,
    serial: String,
    #[arg(value_enum)]
    output: Target,
    #[arg(value_enum)]
    switch: Switch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let pool = SessionPool::new(SessionConfig {
        backoff: Duration::from_secs(5),
        ..SessionConfig::default()
    });
    let descriptor =
        DeviceDescriptor::new(&cli.serial, cli.ip).with_device_type(DeviceType::EnergyStorage);
    let storage = EnergyStorage::new(pool.add_device(descriptor)?);

    println!("Connecting to {}...", storage.name());
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while storage.state().raw_outputs().is_none() {
        if tokio::time::Instant::now() > deadline {
            return Err("device did not report its outputs".into());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let output = Output::from(cli.output);
    storage.set_output(output, matches!(cli.switch, Switch::On))?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let state = storage.state();
    println!(
        "{} is now {}",
        output.name(),
        if state.output(output) == Some(true) { "on" } else { "off" }
    );
    if let Some(percent) = state.battery_percent() {
        println!("Battery: {percent}%");
    }
    if let Some(remaining) = state.time_remaining() {
        println!("Time remaining: {} min", remaining.as_secs() / 60);
    }
    pool.stop();
    Ok(())
}
