//! Lamp modes of energy storage units.

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

/// Built-in LED lamp mode, DPID 33.
///
/// The device reports `Auto` while the lamp is switched off.
///
/// # Examples
///
/// ```
/// use std::str::FromStr;
/// use cozylife_local::LedMode;
///
/// assert_eq!(LedMode::create(5), Some(LedMode::Sos));
/// assert_eq!(LedMode::from_str("Low").unwrap().id(), 1);
/// assert_eq!(LedMode::High.to_string(), "High");
/// ```
#[derive(
    Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumString, Display,
)]
pub enum LedMode {
    High = 0,
    Low = 1,
    #[strum(serialize = "SOS")]
    Sos = 5,
    Auto = 8,
}

impl LedMode {
    pub fn create(value: u32) -> Option<Self> {
        LedMode::iter().find(|mode| mode.id() == value)
    }

    pub fn id(&self) -> u32 {
        *self as u32
    }

    /// Modes a caller may select. `Auto` is only ever reported.
    pub fn selectable() -> impl Iterator<Item = LedMode> {
        LedMode::iter().filter(|mode| *mode != LedMode::Auto)
    }
}
