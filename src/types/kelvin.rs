//! Color temperature control.

use serde::{Deserialize, Serialize};

/// Color temperature in Kelvin, with valid values from 2000K to 6500K.
///
/// Lower values produce warmer (more yellow/orange) light, while higher
/// values produce cooler (more blue) light. Devices report the position
/// within that range as 0 to 1000 on DPID 3.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct Kelvin {
    pub(crate) kelvin: u16,
}

impl Default for Kelvin {
    fn default() -> Self {
        Self::new()
    }
}

impl Kelvin {
    pub const MIN: u16 = 2000;
    pub const MAX: u16 = 6500;
    const DEVICE_MAX: u32 = 1000;

    /// Neutral white, 3500K.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::Kelvin;
    ///
    /// assert_eq!(Kelvin::new().kelvin(), 3500);
    /// ```
    pub fn new() -> Self {
        Kelvin { kelvin: 3500 }
    }

    /// Get the kelvin value.
    pub fn kelvin(&self) -> u16 {
        self.kelvin
    }

    /// Create a new Kelvin with the given value.
    ///
    /// Returns `None` if value is outside the valid range (2000-6500).
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::Kelvin;
    ///
    /// assert!(Kelvin::create(1999).is_none());
    /// assert!(Kelvin::create(2000).is_some());
    /// assert!(Kelvin::create(6500).is_some());
    /// assert!(Kelvin::create(6501).is_none());
    /// ```
    pub fn create(kelvin: u16) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&kelvin) {
            Some(Kelvin { kelvin })
        } else {
            None
        }
    }

    /// Like [`create`](Self::create), clamping into range instead of failing.
    pub fn clamped(kelvin: u16) -> Self {
        Kelvin {
            kelvin: kelvin.clamp(Self::MIN, Self::MAX),
        }
    }

    /// Device value for DPID 3.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::Kelvin;
    ///
    /// assert_eq!(Kelvin::create(2000).unwrap().to_device(), 0);
    /// assert_eq!(Kelvin::create(4250).unwrap().to_device(), 500);
    /// assert_eq!(Kelvin::create(6500).unwrap().to_device(), 1000);
    /// ```
    pub fn to_device(&self) -> u32 {
        let span = f64::from(Self::MAX - Self::MIN);
        let position = f64::from(self.kelvin - Self::MIN) / span;
        (position * f64::from(Self::DEVICE_MAX)).round() as u32
    }

    /// Parse a DPID 3 value. Values above 1000 mean the channel is unused.
    pub fn from_device(raw: u32) -> Option<Self> {
        if raw > Self::DEVICE_MAX {
            return None;
        }
        let span = f64::from(Self::MAX - Self::MIN);
        let offset = (f64::from(raw) / f64::from(Self::DEVICE_MAX) * span).round() as u16;
        Some(Kelvin {
            kelvin: Self::MIN + offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_device() {
        assert_eq!(Kelvin::from_device(0).unwrap().kelvin(), 2000);
        assert_eq!(Kelvin::from_device(1000).unwrap().kelvin(), 6500);
        assert!(Kelvin::from_device(65535).is_none());
    }

    #[test]
    fn test_clamped() {
        assert_eq!(Kelvin::clamped(1000).kelvin(), 2000);
        assert_eq!(Kelvin::clamped(9000).kelvin(), 6500);
    }
}
