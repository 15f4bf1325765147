//! Brightness control for CozyLife lights.

use serde::{Deserialize, Serialize};

/// Brightness on the host scale, 1 to 255.
///
/// Devices use 0 to 1000 on DPID 4; [`to_device`](Self::to_device) and
/// [`from_device`](Self::from_device) convert between the two.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Brightness {
    pub(crate) value: u8,
}

impl Default for Brightness {
    fn default() -> Self {
        Self::new()
    }
}

impl Brightness {
    const MIN: u8 = 1;
    const MAX: u8 = 255;
    const DEVICE_MAX: u32 = 1000;

    /// Full brightness.
    pub fn new() -> Self {
        Brightness { value: Self::MAX }
    }

    pub fn value(&self) -> u8 {
        self.value
    }

    /// Returns None if value is outside valid range (1-255).
    pub fn create(value: u8) -> Option<Self> {
        if Self::is_valid(value) {
            Some(Brightness { value })
        } else {
            None
        }
    }

    /// Returns default (255) if value is invalid.
    pub fn create_or(value: u8) -> Self {
        Self::create(value).unwrap_or_default()
    }

    /// Device value for DPID 4.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::Brightness;
    ///
    /// assert_eq!(Brightness::new().to_device(), 1000);
    /// assert_eq!(Brightness::create(80).unwrap().to_device(), 314);
    /// ```
    pub fn to_device(&self) -> u32 {
        (f64::from(self.value) * f64::from(Self::DEVICE_MAX) / f64::from(Self::MAX)).round() as u32
    }

    /// Parse a DPID 4 value. Values above 1000 mean the channel is unused.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::Brightness;
    ///
    /// assert_eq!(Brightness::from_device(235).unwrap().value(), 60);
    /// assert_eq!(Brightness::from_device(0).unwrap().value(), 1);
    /// assert!(Brightness::from_device(65535).is_none());
    /// ```
    pub fn from_device(raw: u32) -> Option<Self> {
        if raw > Self::DEVICE_MAX {
            return None;
        }
        let scaled = f64::from(raw) * f64::from(Self::MAX) / f64::from(Self::DEVICE_MAX);
        let value = scaled.round() as u8;
        Some(Brightness {
            value: value.max(Self::MIN),
        })
    }

    fn is_valid(value: u8) -> bool {
        (Self::MIN..=Self::MAX).contains(&value)
    }
}
