//! Client configuration.
//!
//! Everything here is plain serde data so the host can load it from whatever
//! file format it already uses.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

use crate::device::{DEFAULT_PORT, DeviceDescriptor, DeviceType};
use crate::discovery::DiscoveryMode;
use crate::errors::Error;
use crate::scan;

type Result<T> = std::result::Result<T, Error>;

/// UDP port devices listen on for discovery probes.
pub const DISCOVERY_PORT: u16 = 6095;

/// Reconnect policy of a device session.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use cozylife_local::SessionConfig;
///
/// let config = SessionConfig::default();
/// assert_eq!(config.backoff, Duration::from_secs(60));
/// assert_eq!(config.connect_timeout, Duration::from_secs(10));
/// ```
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Fixed delay between a failure and the next connect attempt.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub backoff: Duration,
    /// Upper bound on a single connect attempt.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,
}

impl SessionConfig {
    pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(60);
    pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            backoff: Self::DEFAULT_BACKOFF,
            connect_timeout: Self::DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// UDP broadcast discovery settings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Local address the listener binds. Announcements arrive here.
    pub bind_addr: SocketAddr,
    /// Where INFO probes are sent.
    pub probe_addr: SocketAddr,
    /// Resend the probe periodically. `None` probes once at start.
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reprobe_interval: Option<Duration>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            bind_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, DISCOVERY_PORT)),
            probe_addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::BROADCAST, DISCOVERY_PORT)),
            reprobe_interval: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// A statically configured device.
///
/// The serial number may be left out. The device is then identified by
/// asking it over TCP, see [`DeviceEntry::resolve`].
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEntry {
    #[serde(default)]
    pub serial_number: Option<String>,
    pub ip: Ipv4Addr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub device_type: Option<DeviceType>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl DeviceEntry {
    /// An entry for a device known only by its address.
    pub fn from_ip(ip: Ipv4Addr) -> Self {
        DeviceEntry {
            serial_number: None,
            ip,
            port: DEFAULT_PORT,
            device_type: None,
            alias: None,
        }
    }

    /// Descriptor for this entry, `None` until the serial number is known.
    pub fn descriptor(&self) -> Option<DeviceDescriptor> {
        let serial = self.serial_number.as_deref()?;
        Some(self.apply(DeviceDescriptor::new(serial, self.ip).with_port(self.port)))
    }

    /// Descriptor for this entry, asking the device for its serial number
    /// and type when the entry does not name them.
    pub async fn resolve(&self, within: Duration) -> Result<DeviceDescriptor> {
        if let Some(descriptor) = self.descriptor() {
            return Ok(descriptor);
        }
        let found = scan::probe(self.ip, self.port, within).await?;
        debug!("Resolved {}:{} to {}", self.ip, self.port, found.serial());
        Ok(self.apply(found))
    }

    // Configured values win over what the device reports.
    fn apply(&self, mut descriptor: DeviceDescriptor) -> DeviceDescriptor {
        if let Some(device_type) = &self.device_type {
            descriptor = descriptor.with_device_type(device_type.clone());
        }
        if let Some(alias) = &self.alias {
            descriptor = descriptor.with_alias(alias);
        }
        descriptor
    }
}

/// Top-level configuration of a [`SessionPool`](crate::SessionPool).
///
/// # Examples
///
/// ```
/// use cozylife_local::ClientConfig;
///
/// let config: ClientConfig = serde_json::from_str(r#"{
///     "devices": [{"serial_number": "629168597cb94c4c1d8f", "ip": "192.168.1.57", "device_type": "02"}],
///     "session": {"backoff": 30}
/// }"#).unwrap();
///
/// assert_eq!(config.devices[0].port, 5555);
/// assert_eq!(config.session.backoff.as_secs(), 30);
/// assert!(config.discovery.is_none());
/// ```
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
    /// Broadcast discovery. Absent means the device list is static.
    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,
    #[serde(default)]
    pub session: SessionConfig,
}

impl ClientConfig {
    pub fn discovery_mode(&self) -> DiscoveryMode {
        match &self.discovery {
            Some(config) => DiscoveryMode::Broadcast(config.clone()),
            None => DiscoveryMode::Static,
        }
    }

    /// Descriptors of the entries that name a serial number.
    pub fn descriptors(&self) -> Vec<DeviceDescriptor> {
        self.devices.iter().filter_map(DeviceEntry::descriptor).collect()
    }
}
