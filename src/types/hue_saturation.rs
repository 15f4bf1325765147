//! Hue and Saturation color representation.

use serde::{Deserialize, Serialize};

use super::Color;

/// Hue and Saturation color representation.
///
/// - Hue: The color angle on the color wheel (0-360 degrees)
/// - Saturation: The intensity of the color (0-100 percent)
///
/// Devices take the hue in degrees on DPID 5 and the saturation in tenths
/// of a percent (0-1000) on DPID 6.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct HueSaturation {
    hue: u16,
    saturation: u8,
}

impl HueSaturation {
    const DEVICE_SATURATION_SCALE: u32 = 10;

    /// Create a new HueSaturation with the given values.
    ///
    /// Returns `None` if values are outside valid ranges.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::HueSaturation;
    ///
    /// assert!(HueSaturation::create(0, 100).is_some());   // Red at full saturation
    /// assert!(HueSaturation::create(120, 50).is_some()); // Green at 50% saturation
    /// assert!(HueSaturation::create(361, 50).is_none()); // Invalid hue
    /// assert!(HueSaturation::create(180, 101).is_none()); // Invalid saturation
    /// ```
    pub fn create(hue: u16, saturation: u8) -> Option<Self> {
        if hue <= 360 && saturation <= 100 {
            Some(HueSaturation { hue, saturation })
        } else {
            None
        }
    }

    /// Get the hue value.
    pub fn hue(&self) -> u16 {
        self.hue
    }

    /// Get the saturation value.
    pub fn saturation(&self) -> u8 {
        self.saturation
    }

    /// Device values for DPIDs 5 and 6.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::HueSaturation;
    ///
    /// let hs = HueSaturation::create(240, 75).unwrap();
    /// assert_eq!(hs.to_device(), (240, 750));
    /// ```
    pub fn to_device(&self) -> (u32, u32) {
        (
            u32::from(self.hue),
            u32::from(self.saturation) * Self::DEVICE_SATURATION_SCALE,
        )
    }

    /// Parse DPID 5 and 6 values. `None` if either is out of range.
    pub fn from_device(hue: u32, saturation: u32) -> Option<Self> {
        let saturation = (f64::from(saturation) / f64::from(Self::DEVICE_SATURATION_SCALE)).round();
        Self::create(u16::try_from(hue).ok()?, u8::try_from(saturation as u32).ok()?)
    }

    /// Hue and saturation of an RGB color. Its value component is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::{Color, HueSaturation};
    ///
    /// let hs = HueSaturation::from_color(&Color::rgb(0, 0, 255));
    /// assert_eq!((hs.hue(), hs.saturation()), (240, 100));
    /// ```
    pub fn from_color(color: &Color) -> Self {
        let r = f32::from(color.red) / 255.0;
        let g = f32::from(color.green) / 255.0;
        let b = f32::from(color.blue) / 255.0;

        let max = r.max(g).max(b);
        let min = r.min(g).min(b);
        let delta = max - min;

        if max == 0.0 || delta == 0.0 {
            return HueSaturation::default();
        }

        let sector = if max == r {
            ((g - b) / delta).rem_euclid(6.0)
        } else if max == g {
            (b - r) / delta + 2.0
        } else {
            (r - g) / delta + 4.0
        };
        let hue = (sector * 60.0).round() as u16 % 360;
        let saturation = (delta / max * 100.0).round() as u8;
        HueSaturation { hue, saturation }
    }

    /// Convert to RGB Color.
    ///
    /// Uses HSV to RGB conversion with Value fixed at 255 (max brightness).
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::HueSaturation;
    ///
    /// let hs = HueSaturation::create(0, 100).unwrap();
    /// let color = hs.to_color();
    /// assert_eq!(color.red(), 255);
    /// assert_eq!(color.green(), 0);
    /// assert_eq!(color.blue(), 0);
    /// ```
    pub fn to_color(&self) -> Color {
        let h = self.hue as f32;
        let s = self.saturation as f32 / 100.0;
        let v = 1.0;

        if s == 0.0 {
            let gray = (v * 255.0) as u8;
            return Color::rgb(gray, gray, gray);
        }

        let h = h / 60.0;
        let i = h.floor() as i32;
        let f = h - i as f32;
        let p = v * (1.0 - s);
        let q = v * (1.0 - s * f);
        let t = v * (1.0 - s * (1.0 - f));

        let (r, g, b) = match i % 6 {
            0 => (v, t, p),
            1 => (q, v, p),
            2 => (p, v, t),
            3 => (p, q, v),
            4 => (t, p, v),
            _ => (v, p, q),
        };

        Color::rgb((r * 255.0) as u8, (g * 255.0) as u8, (b * 255.0) as u8)
    }
}

impl From<&HueSaturation> for Color {
    fn from(hs: &HueSaturation) -> Self {
        hs.to_color()
    }
}

impl From<&Color> for HueSaturation {
    fn from(color: &Color) -> Self {
        HueSaturation::from_color(color)
    }
}
