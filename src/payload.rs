//! Light commands.

use serde::{Deserialize, Serialize};

use crate::types::{Brightness, Color, HueSaturation, Kelvin, PowerMode};

/// A command for a CozyLife light.
///
/// Fields left unset keep their current value. Setting a colour drops any
/// colour temperature in the command and vice versa, so the last one set
/// decides the colour mode.
///
/// # Creating Commands
///
/// 1. **From a single attribute** using the [`From`] trait:
///    ```
///    use cozylife_local::{Kelvin, LightCommand};
///    let command = LightCommand::from(&Kelvin::create(2700).unwrap());
///    ```
///
/// 2. **Builder pattern** for combining multiple attributes:
///    ```
///    use std::str::FromStr;
///    use cozylife_local::{Brightness, Color, LightCommand};
///    let mut command = LightCommand::new();
///    command.brightness(&Brightness::create(80).unwrap());
///    command.color(&Color::from_str("255,128,0").unwrap());
///    ```
#[serde_with::skip_serializing_none]
#[derive(Default, Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LightCommand {
    pub(crate) power: Option<PowerMode>,
    pub(crate) brightness: Option<Brightness>,
    pub(crate) hs: Option<HueSaturation>,
    pub(crate) kelvin: Option<Kelvin>,
}

impl LightCommand {
    /// An empty command. Sending it turns the light on with its current settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn the light on, keeping brightness and colour.
    pub fn turn_on() -> Self {
        Self::from(&PowerMode::On)
    }

    /// Turn the light off. Any other field in the command is ignored.
    pub fn turn_off() -> Self {
        Self::from(&PowerMode::Off)
    }

    /// Set the power state.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::{LightCommand, PowerMode};
    ///
    /// let mut command = LightCommand::new();
    /// command.power(&PowerMode::Off);
    /// assert!(command.turns_off());
    /// ```
    pub fn power(&mut self, power: &PowerMode) -> &mut Self {
        self.power = Some(*power);
        self
    }

    pub fn brightness(&mut self, brightness: &Brightness) -> &mut Self {
        self.brightness = Some(*brightness);
        self
    }

    /// Set the colour temperature. Clears any colour already in the command.
    pub fn temp(&mut self, kelvin: &Kelvin) -> &mut Self {
        self.kelvin = Some(*kelvin);
        self.hs = None;
        self
    }

    /// Set the colour using hue and saturation. Clears any colour temperature.
    pub fn hue_saturation(&mut self, hs: &HueSaturation) -> &mut Self {
        self.hs = Some(*hs);
        self.kelvin = None;
        self
    }

    /// Set an RGB colour. The device only takes hue and saturation, so the
    /// colour's value component is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::{Color, LightCommand};
    ///
    /// let mut command = LightCommand::new();
    /// command.color(&Color::rgb(0, 255, 0));
    /// assert_eq!(command.get_hue_saturation().unwrap().hue(), 120);
    /// ```
    pub fn color(&mut self, color: &Color) -> &mut Self {
        self.hue_saturation(&HueSaturation::from_color(color))
    }

    pub fn get_power(&self) -> Option<PowerMode> {
        self.power
    }

    pub fn get_brightness(&self) -> Option<Brightness> {
        self.brightness
    }

    pub fn get_hue_saturation(&self) -> Option<HueSaturation> {
        self.hs
    }

    pub fn get_temp(&self) -> Option<Kelvin> {
        self.kelvin
    }

    pub fn turns_off(&self) -> bool {
        self.power == Some(PowerMode::Off)
    }
}

impl From<&PowerMode> for LightCommand {
    fn from(power: &PowerMode) -> Self {
        let mut c = LightCommand::new();
        c.power(power);
        c
    }
}

impl From<&Brightness> for LightCommand {
    fn from(brightness: &Brightness) -> Self {
        let mut c = LightCommand::new();
        c.brightness(brightness);
        c
    }
}

impl From<&Kelvin> for LightCommand {
    fn from(kelvin: &Kelvin) -> Self {
        let mut c = LightCommand::new();
        c.temp(kelvin);
        c
    }
}

impl From<&HueSaturation> for LightCommand {
    fn from(hs: &HueSaturation) -> Self {
        let mut c = LightCommand::new();
        c.hue_saturation(hs);
        c
    }
}

impl From<&Color> for LightCommand {
    fn from(color: &Color) -> Self {
        let mut c = LightCommand::new();
        c.color(color);
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_colour_wins() {
        let mut command = LightCommand::new();
        command
            .hue_saturation(&HueSaturation::create(10, 20).unwrap())
            .temp(&Kelvin::new());
        assert!(command.get_hue_saturation().is_none());
        assert_eq!(command.get_temp(), Some(Kelvin::new()));

        command.color(&Color::rgb(255, 0, 0));
        assert!(command.get_temp().is_none());
    }

    #[test]
    fn test_serialize_skips_unset() {
        let command = LightCommand::from(&Brightness::create(10).unwrap());
        assert_eq!(
            serde_json::to_value(&command).unwrap(),
            serde_json::json!({"brightness": {"value": 10}})
        );
    }
}
