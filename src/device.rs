//! Device identity, addressing and type detection.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

/// TCP control port of every CozyLife device.
pub const DEFAULT_PORT: u16 = 5555;

/// Data point identifiers, by device class.
pub mod dpid {
    use crate::codec::Dpid;

    /// Power for lights and switches (0 off, 255 on).
    pub const SWITCH: Dpid = 1;
    pub const WORK_MODE: Dpid = 2;
    /// Colour temperature, 0..=1000 over the lamp's kelvin range.
    pub const TEMP: Dpid = 3;
    /// Brightness, 0..=1000.
    pub const BRIGHT: Dpid = 4;
    /// Hue in degrees.
    pub const HUE: Dpid = 5;
    /// Saturation times ten.
    pub const SAT: Dpid = 6;

    /// Output bitmask of an energy storage unit.
    pub const ENERGY_OUTPUTS: Dpid = 1;
    pub const ENERGY_BATTERY_PERCENT: Dpid = 3;
    pub const ENERGY_OUTPUT_POWER: Dpid = 4;
    pub const ENERGY_TIME_REMAINING: Dpid = 30;
    pub const ENERGY_INPUT_POWER: Dpid = 32;
    pub const ENERGY_LED_MODE: Dpid = 33;
    pub const ENERGY_MAX_OUTPUT: Dpid = 40;
    pub const ENERGY_CAPACITY: Dpid = 41;
}

/// Device class, from the `dtp` code in the INFO reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DeviceType {
    /// Switches and plugs, code "00".
    Switch,
    /// Colour and colour-temperature lights, code "01".
    Light,
    /// Battery energy storage units, code "02".
    EnergyStorage,
    Other(String),
}

impl DeviceType {
    pub fn from_code(code: &str) -> Self {
        match code {
            "00" => DeviceType::Switch,
            "01" => DeviceType::Light,
            "02" => DeviceType::EnergyStorage,
            other => DeviceType::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            DeviceType::Switch => "00",
            DeviceType::Light => "01",
            DeviceType::EnergyStorage => "02",
            DeviceType::Other(code) => code,
        }
    }

    /// Human readable class name.
    pub fn name(&self) -> &str {
        match self {
            DeviceType::Switch => "Switch",
            DeviceType::Light => "Light",
            DeviceType::EnergyStorage => "Energy Storage",
            DeviceType::Other(_) => "CozyLife Device",
        }
    }
}

impl From<String> for DeviceType {
    fn from(code: String) -> Self {
        DeviceType::from_code(&code)
    }
}

impl From<DeviceType> for String {
    fn from(device_type: DeviceType) -> Self {
        device_type.code().to_string()
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `msg` body of an INFO reply.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "did")]
    pub serial: String,
    #[serde(rename = "dtp", default)]
    pub device_type: Option<DeviceType>,
    #[serde(rename = "pid", default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    /// Address the device reports for itself.
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub rssi: Option<i32>,
    #[serde(rename = "sv", default)]
    pub software_version: Option<String>,
    #[serde(rename = "hv", default)]
    pub hardware_version: Option<String>,
}

/// Identity and address of one device.
///
/// # Examples
///
/// ```
/// use std::net::Ipv4Addr;
/// use cozylife_local::{DeviceDescriptor, DeviceType};
///
/// let device = DeviceDescriptor::new("629168597cb94c4c1d8f", Ipv4Addr::new(192, 168, 1, 57))
///     .with_device_type(DeviceType::EnergyStorage);
/// assert_eq!(device.port(), 5555);
/// assert_eq!(device.display_name(), "Energy Storage 1d8f");
/// ```
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    serial: String,
    ip: Ipv4Addr,
    port: u16,
    device_type: Option<DeviceType>,
    product_id: Option<String>,
    alias: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(serial: &str, ip: Ipv4Addr) -> Self {
        DeviceDescriptor {
            serial: serial.to_string(),
            ip,
            port: DEFAULT_PORT,
            device_type: None,
            product_id: None,
            alias: None,
        }
    }

    /// Build a descriptor from an INFO reply received from `source`.
    ///
    /// The address the device reports wins over `source` when it parses.
    pub fn from_info(info: &DeviceInfo, source: Ipv4Addr) -> Self {
        let ip = info
            .ip
            .as_deref()
            .and_then(|ip| ip.parse().ok())
            .unwrap_or(source);

        DeviceDescriptor {
            serial: info.serial.clone(),
            ip,
            port: DEFAULT_PORT,
            device_type: info.device_type.clone(),
            product_id: info.product_id.clone(),
            alias: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.device_type = Some(device_type);
        self
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias = Some(alias.to_string());
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.port))
    }

    pub fn device_type(&self) -> Option<&DeviceType> {
        self.device_type.as_ref()
    }

    pub fn product_id(&self) -> Option<&str> {
        self.product_id.as_deref()
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Alias if set, otherwise the class name and the last four serial characters.
    pub fn display_name(&self) -> String {
        if let Some(alias) = &self.alias {
            return alias.clone();
        }
        let class = self
            .device_type
            .as_ref()
            .map_or("CozyLife Device", DeviceType::name);
        let tail_start = self
            .serial
            .char_indices()
            .rev()
            .nth(3)
            .map_or(0, |(i, _)| i);
        format!("{class} {}", &self.serial[tail_start..])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_codes() {
        assert_eq!(DeviceType::from_code("00"), DeviceType::Switch);
        assert_eq!(DeviceType::from_code("01"), DeviceType::Light);
        assert_eq!(DeviceType::from_code("02"), DeviceType::EnergyStorage);
        assert_eq!(
            DeviceType::from_code("07"),
            DeviceType::Other("07".to_string())
        );
        assert_eq!(DeviceType::Other("07".to_string()).code(), "07");
    }

    #[test]
    fn test_device_type_serde() {
        let json = serde_json::to_string(&DeviceType::Light).unwrap();
        assert_eq!(json, "\"01\"");
        let parsed: DeviceType = serde_json::from_str("\"02\"").unwrap();
        assert_eq!(parsed, DeviceType::EnergyStorage);
    }

    #[test]
    fn test_from_info_prefers_reported_ip() {
        let info: DeviceInfo = serde_json::from_str(
            r#"{"did":"abc123","dtp":"01","pid":"p1","ip":"10.0.0.9"}"#,
        )
        .unwrap();
        let device = DeviceDescriptor::from_info(&info, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(device.ip(), Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(device.device_type(), Some(&DeviceType::Light));
        assert_eq!(device.product_id(), Some("p1"));

        let info: DeviceInfo = serde_json::from_str(r#"{"did":"abc123"}"#).unwrap();
        let device = DeviceDescriptor::from_info(&info, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(device.ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert!(device.device_type().is_none());
    }

    #[test]
    fn test_display_name() {
        let device = DeviceDescriptor::new("ab", Ipv4Addr::LOCALHOST);
        assert_eq!(device.display_name(), "CozyLife Device ab");

        let device = device.with_alias("Garage");
        assert_eq!(device.display_name(), "Garage");
    }

    #[test]
    fn test_socket_addr() {
        let device = DeviceDescriptor::new("x", Ipv4Addr::new(192, 168, 0, 2)).with_port(6000);
        assert_eq!(device.socket_addr(), "192.168.0.2:6000".parse().unwrap());
    }
}
