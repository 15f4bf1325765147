//! # cozylife_local
//!
//! An async Rust library for controlling CozyLife smart-home devices over the
//! local network, without the vendor cloud.
//!
//! This crate provides a **runtime-agnostic** async API. Each device gets a
//! [`DeviceSession`]: one long-lived TCP connection on port 5555 that
//! reconnects on its own after a fixed backoff and fans every frame the
//! device sends out to subscribers. Entity handles on top of a session keep
//! local state in step with the device.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::net::Ipv4Addr;
//! use cozylife_local::{
//!     Brightness, DeviceDescriptor, Light, LightCommand, SessionConfig, SessionPool,
//! };
//!
//! async fn control_light() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = SessionPool::new(SessionConfig::default());
//!     let descriptor = DeviceDescriptor::new("629168597cb94c4c1d8f", Ipv4Addr::new(192, 168, 1, 57));
//!     let light = Light::new(pool.add_device(descriptor)?);
//!
//!     let mut command = LightCommand::turn_on();
//!     command.brightness(&Brightness::create(80).unwrap());
//!     light.set(&command)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - **Runtime Agnostic**: Works with tokio, async-std, or smol async runtimes
//! - **Sessions**: Persistent connections with a fixed reconnect backoff, see [`DeviceSession`]
//! - **Session Pool**: Many devices, none holding up another, see [`SessionPool`]
//! - **Discovery**: UDP broadcast on port 6095 with [`DiscoveryListener`] or [`discover_devices`]
//! - **Scanning**: Direct TCP probes of address ranges with [`scan`]
//! - **Lights**: Optimistic control of power, brightness, colour and temperature with [`Light`]
//! - **Switches**: On/off control with [`Switch`]
//! - **Energy Storage**: Output toggles through the [`bitmask`] translator and sensor readings with [`EnergyStorage`]
//! - **Subscriptions**: Every inbound frame as a callback or a [`FrameStream`]
//!
//! ## Runtime Selection
//!
//! Select your preferred runtime using feature flags:
//!
//! ### Using tokio (default)
//!
//! ```toml
//! [dependencies]
//! cozylife-local = "0.1"
//! tokio = { version = "1", features = ["rt-multi-thread", "macros"] }
//! ```
//!
//! ### Using async-std
//!
//! ```toml
//! [dependencies]
//! cozylife-local = { version = "0.1", default-features = false, features = ["runtime-async-std"] }
//! async-std = { version = "1.12", features = ["attributes"] }
//! ```
//!
//! ### Using smol
//!
//! ```toml
//! [dependencies]
//! cozylife-local = { version = "0.1", default-features = false, features = ["runtime-smol"] }
//! smol = "2"
//! ```
//!
//! ## Feature Flags
//!
//! - `runtime-tokio` (default): Use the tokio async runtime
//! - `runtime-async-std`: Use the async-std runtime
//! - `runtime-smol`: Use the smol runtime
//!
//! ## Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade and never
//! installs a logger.

pub mod bitmask;
pub mod codec;
mod config;
mod device;
mod discovery;
mod energy;
mod errors;
mod history;
mod light;
mod payload;
mod pool;
mod reconciler;
pub mod runtime;
pub mod scan;
mod session;
mod status;
mod subscription;
mod switch;
#[cfg(all(test, feature = "runtime-tokio"))]
mod testing;
mod types;

// Re-export public API
pub use bitmask::{Output, OutputOverrides, Outputs};
pub use codec::{CommandType, DataPointMap, Dpid, Frame};
pub use config::{ClientConfig, DISCOVERY_PORT, DeviceEntry, DiscoveryConfig, SessionConfig};
pub use device::{DEFAULT_PORT, DeviceDescriptor, DeviceInfo, DeviceType, dpid};
pub use discovery::{
    DiscoveryEvent, DiscoveryListener, DiscoveryMode, DiscoveryStream, ListenerState,
    discover_devices,
};
pub use energy::{EnergyState, EnergyStorage};
pub use errors::Error;
pub use history::{Direction, HistoryEntry, HistorySummary, MessageHistory};
pub use light::Light;
pub use payload::LightCommand;
pub use pool::SessionPool;
pub use reconciler::{Delivery, Device, DeviceState, identify};
pub use session::{ConnectionState, DeviceSession, SessionEvent};
pub use status::{ColorMode, LightFeatures, LightState};
pub use subscription::{FrameCallback, FrameStream, SubscriptionId};
pub use switch::{Switch, SwitchState};
pub use types::{Brightness, Color, HueSaturation, Kelvin, LedMode, PowerMode};
