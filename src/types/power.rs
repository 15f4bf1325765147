//! Power mode for lights and switches.

use serde::{Deserialize, Serialize};

/// Power state, DPID 1 on lights and switches.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    On,
    Off,
}

impl PowerMode {
    const ON: u32 = 255;

    /// Device value: 255 for on, 0 for off.
    pub fn to_device(&self) -> u32 {
        match self {
            PowerMode::On => Self::ON,
            PowerMode::Off => 0,
        }
    }

    /// Any non-zero value is on.
    pub fn from_device(raw: u32) -> Self {
        if raw == 0 { PowerMode::Off } else { PowerMode::On }
    }

    pub fn is_on(&self) -> bool {
        matches!(self, PowerMode::On)
    }
}

impl From<bool> for PowerMode {
    fn from(on: bool) -> Self {
        if on { PowerMode::On } else { PowerMode::Off }
    }
}
