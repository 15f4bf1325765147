//! Output bitmask of energy storage units.
//!
//! DPID 1 on an energy storage unit packs the three outputs into one integer.
//! Bits above bit 2 are not assigned but are carried through unchanged.

use serde::{Deserialize, Serialize};

/// AC inverter output.
pub const BIT_AC: u32 = 1 << 0;
/// Built-in LED lamp.
pub const BIT_LED: u32 = 1 << 1;
/// 12V DC output.
pub const BIT_DC12V: u32 = 1 << 2;

/// One switchable output of an energy storage unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Output {
    Ac,
    Led,
    Dc12v,
}

impl Output {
    pub const ALL: [Output; 3] = [Output::Ac, Output::Led, Output::Dc12v];

    pub fn bit(&self) -> u32 {
        match self {
            Output::Ac => BIT_AC,
            Output::Led => BIT_LED,
            Output::Dc12v => BIT_DC12V,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Output::Ac => "AC",
            Output::Led => "LED",
            Output::Dc12v => "DC 12V",
        }
    }
}

/// Decoded output switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outputs {
    pub ac: bool,
    pub led: bool,
    pub dc12v: bool,
}

impl Outputs {
    pub fn get(&self, output: Output) -> bool {
        match output {
            Output::Ac => self.ac,
            Output::Led => self.led,
            Output::Dc12v => self.dc12v,
        }
    }
}

/// Requested changes. `None` leaves an output as it is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputOverrides {
    pub ac: Option<bool>,
    pub led: Option<bool>,
    pub dc12v: Option<bool>,
}

impl OutputOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one output, builder style.
    pub fn with(mut self, output: Output, on: bool) -> Self {
        match output {
            Output::Ac => self.ac = Some(on),
            Output::Led => self.led = Some(on),
            Output::Dc12v => self.dc12v = Some(on),
        }
        self
    }

    pub fn get(&self, output: Output) -> Option<bool> {
        match output {
            Output::Ac => self.ac,
            Output::Led => self.led,
            Output::Dc12v => self.dc12v,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ac.is_none() && self.led.is_none() && self.dc12v.is_none()
    }
}

/// Split a raw mask into its output switches.
///
/// # Examples
///
/// ```
/// use cozylife_local::bitmask::decode_outputs;
///
/// let outputs = decode_outputs(5);
/// assert!(outputs.ac);
/// assert!(!outputs.led);
/// assert!(outputs.dc12v);
/// ```
pub fn decode_outputs(mask: u32) -> Outputs {
    Outputs {
        ac: mask & BIT_AC != 0,
        led: mask & BIT_LED != 0,
        dc12v: mask & BIT_DC12V != 0,
    }
}

/// Apply overrides to the current mask.
///
/// Every bit not named by an override, including unassigned high bits, keeps
/// its current value.
///
/// # Examples
///
/// ```
/// use cozylife_local::bitmask::{Output, OutputOverrides, encode_outputs};
///
/// let mask = encode_outputs(0b101, OutputOverrides::new().with(Output::Led, true));
/// assert_eq!(mask, 0b111);
/// ```
pub fn encode_outputs(current: u32, overrides: OutputOverrides) -> u32 {
    Output::ALL.iter().fold(current, |mask, output| {
        match overrides.get(*output) {
            Some(true) => mask | output.bit(),
            Some(false) => mask & !output.bit(),
            None => mask,
        }
    })
}
