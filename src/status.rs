//! Light state tracking.

use serde::{Deserialize, Serialize};

use crate::codec::{CommandType, DataPointMap, Dpid, Frame};
use crate::device::dpid;
use crate::payload::LightCommand;
use crate::types::{Brightness, Color, HueSaturation, Kelvin, PowerMode};

/// How the light is currently producing colour.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorMode {
    OnOff,
    Brightness,
    ColorTemp,
    HueSaturation,
}

/// Channels a light reports, from the DPIDs it lists in a QUERY reply.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct LightFeatures {
    pub brightness: bool,
    pub color_temp: bool,
    pub hue_saturation: bool,
}

impl LightFeatures {
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::{ColorMode, LightFeatures};
    ///
    /// let features = LightFeatures::from_dpids([1, 2, 3, 4, 5, 6]);
    /// assert_eq!(features.color_modes(), vec![ColorMode::HueSaturation, ColorMode::ColorTemp]);
    ///
    /// let dimmer = LightFeatures::from_dpids([1, 4]);
    /// assert_eq!(dimmer.color_modes(), vec![ColorMode::Brightness]);
    /// ```
    pub fn from_dpids(dpids: impl IntoIterator<Item = Dpid>) -> Self {
        let dpids: Vec<Dpid> = dpids.into_iter().collect();
        LightFeatures {
            brightness: dpids.contains(&dpid::BRIGHT),
            color_temp: dpids.contains(&dpid::TEMP),
            hue_saturation: dpids.contains(&dpid::HUE) && dpids.contains(&dpid::SAT),
        }
    }

    /// Supported colour modes, most capable first.
    pub fn color_modes(&self) -> Vec<ColorMode> {
        let mut modes = Vec::new();
        if self.hue_saturation {
            modes.push(ColorMode::HueSaturation);
        }
        if self.color_temp {
            modes.push(ColorMode::ColorTemp);
        }
        if self.brightness && modes.is_empty() {
            modes.push(ColorMode::Brightness);
        }
        if modes.is_empty() {
            modes.push(ColorMode::OnOff);
        }
        modes
    }

    /// Mode a light starts in when nothing else is known. Colour temperature if supported.
    fn default_mode(&self) -> ColorMode {
        if self.color_temp {
            ColorMode::ColorTemp
        } else {
            self.color_modes()[0]
        }
    }
}

/// Last known state of a light.
///
/// Commands are applied optimistically as soon as they are issued; frames
/// from the device overwrite whatever they report. Everything starts
/// unknown.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct LightState {
    power: Option<PowerMode>,
    brightness: Option<Brightness>,
    hs: Option<HueSaturation>,
    kelvin: Option<Kelvin>,
    color_mode: Option<ColorMode>,
    features: Option<LightFeatures>,
}

impl LightState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn power(&self) -> Option<PowerMode> {
        self.power
    }

    pub fn is_on(&self) -> bool {
        self.power.is_some_and(|power| power.is_on())
    }

    pub fn brightness(&self) -> Option<Brightness> {
        self.brightness
    }

    pub fn hue_saturation(&self) -> Option<HueSaturation> {
        self.hs
    }

    /// The hue and saturation as a fully bright RGB colour.
    pub fn color(&self) -> Option<Color> {
        self.hs.as_ref().map(HueSaturation::to_color)
    }

    pub fn temp(&self) -> Option<Kelvin> {
        self.kelvin
    }

    pub fn color_mode(&self) -> Option<ColorMode> {
        self.color_mode
    }

    pub fn features(&self) -> Option<LightFeatures> {
        self.features
    }

    pub(crate) fn set_features(&mut self, features: LightFeatures) {
        self.features = Some(features);
    }

    /// Apply a command as if the device had accepted it.
    ///
    /// Unknown brightness falls back to full and unknown colour temperature
    /// to 3500K, so a bare turn-on always carries a complete setting.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::{Brightness, LightCommand, LightState, PowerMode};
    ///
    /// let mut command = LightCommand::turn_on();
    /// command.brightness(&Brightness::create(80).unwrap());
    ///
    /// let mut state = LightState::new();
    /// state.apply_command(&command);
    /// assert_eq!(state.power(), Some(PowerMode::On));
    /// assert_eq!(state.brightness().unwrap().value(), 80);
    /// assert_eq!(state.temp().unwrap().kelvin(), 3500);
    /// ```
    pub fn apply_command(&mut self, command: &LightCommand) {
        if command.turns_off() {
            self.power = Some(PowerMode::Off);
            return;
        }
        self.power = Some(PowerMode::On);

        if self.features.is_none_or(|features| features.brightness) {
            self.brightness = Some(command.brightness.or(self.brightness).unwrap_or_default());
        }

        let mode = if command.hs.is_some() {
            ColorMode::HueSaturation
        } else if command.kelvin.is_some() {
            ColorMode::ColorTemp
        } else {
            self.color_mode.unwrap_or_else(|| self.default_mode())
        };

        match mode {
            ColorMode::HueSaturation => {
                if let Some(hs) = command.hs.or(self.hs) {
                    self.hs = Some(hs);
                    self.kelvin = None;
                    self.color_mode = Some(mode);
                }
            }
            ColorMode::ColorTemp => {
                self.kelvin = Some(command.kelvin.or(self.kelvin).unwrap_or_default());
                self.hs = None;
                self.color_mode = Some(mode);
            }
            other => self.color_mode = Some(other),
        }
    }

    /// Fold data points reported by the device. Out of range values are skipped.
    pub fn apply_data_points(&mut self, data: &DataPointMap) {
        if let Some(raw) = data.get_u32(dpid::SWITCH) {
            self.power = Some(PowerMode::from_device(raw));
        }
        if let Some(brightness) = data.get_u32(dpid::BRIGHT).and_then(Brightness::from_device) {
            self.brightness = Some(brightness);
        }

        let kelvin = data.get_u32(dpid::TEMP).and_then(Kelvin::from_device);
        let hue = data.get_u32(dpid::HUE);
        let saturation = data.get_u32(dpid::SAT);
        let hs = if hue.is_some() || saturation.is_some() {
            let (current_hue, current_saturation) =
                self.hs.map(|hs| hs.to_device()).unwrap_or_default();
            HueSaturation::from_device(
                hue.unwrap_or(current_hue),
                saturation.unwrap_or(current_saturation),
            )
        } else {
            None
        };

        match (hs, kelvin) {
            (Some(hs), None) => {
                self.hs = Some(hs);
                self.color_mode = Some(ColorMode::HueSaturation);
            }
            (None, Some(kelvin)) => {
                self.kelvin = Some(kelvin);
                self.color_mode = Some(ColorMode::ColorTemp);
            }
            (Some(hs), Some(kelvin)) => {
                self.hs = Some(hs);
                self.kelvin = Some(kelvin);
                if !matches!(
                    self.color_mode,
                    Some(ColorMode::HueSaturation | ColorMode::ColorTemp)
                ) {
                    self.color_mode = Some(self.default_mode());
                }
            }
            (None, None) => {}
        }
    }

    /// Fold a frame from the device. QUERY replies also reveal the features.
    pub fn apply_frame(&mut self, frame: &Frame) {
        if frame.command == CommandType::Query
            && (!frame.attrs.is_empty() || !frame.data.is_empty())
        {
            let dpids = frame.attrs.iter().copied().chain(frame.data.dpids());
            self.features = Some(LightFeatures::from_dpids(dpids));
        }
        if frame.carries_state() {
            self.apply_data_points(&frame.data);
        }
    }

    /// Data points that bring the device to this state.
    ///
    /// Off is just DPID 1. On always carries power and work mode, then
    /// brightness and the channel of the active colour mode.
    pub fn to_data_points(&self) -> DataPointMap {
        if self.power == Some(PowerMode::Off) {
            return DataPointMap::new().with(dpid::SWITCH, PowerMode::Off.to_device());
        }

        let mut data = DataPointMap::new()
            .with(dpid::SWITCH, PowerMode::On.to_device())
            .with(dpid::WORK_MODE, 0);
        if let Some(brightness) = self.brightness {
            data.insert(dpid::BRIGHT, brightness.to_device());
        }
        match self.color_mode {
            Some(ColorMode::HueSaturation) => {
                if let Some(hs) = self.hs {
                    let (hue, saturation) = hs.to_device();
                    data.insert(dpid::HUE, hue);
                    data.insert(dpid::SAT, saturation);
                }
            }
            Some(ColorMode::ColorTemp) => {
                if let Some(kelvin) = self.kelvin {
                    data.insert(dpid::TEMP, kelvin.to_device());
                }
            }
            _ => {}
        }
        data
    }

    fn default_mode(&self) -> ColorMode {
        self.features
            .map_or(ColorMode::ColorTemp, |features| features.default_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn on_with_brightness(value: u8) -> LightCommand {
        let mut command = LightCommand::turn_on();
        command.brightness(&Brightness::create(value).unwrap());
        command
    }

    fn data(value: serde_json::Value) -> DataPointMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_bare_turn_on_uses_fallbacks() {
        let mut state = LightState::new();
        state.apply_command(&LightCommand::turn_on());
        assert_eq!(
            state.to_data_points(),
            data(json!({"1": 255, "2": 0, "3": 333, "4": 1000}))
        );
        assert_eq!(state.color_mode(), Some(ColorMode::ColorTemp));
    }

    #[test]
    fn test_turn_off_sends_power_only() {
        let mut state = LightState::new();
        state.apply_command(&on_with_brightness(100));
        state.apply_command(&LightCommand::turn_off());
        assert_eq!(state.to_data_points(), data(json!({"1": 0})));
        assert_eq!(state.brightness().unwrap().value(), 100);
        assert!(!state.is_on());
    }

    #[test]
    fn test_colour_command_switches_mode() {
        let mut state = LightState::new();
        state.apply_command(&LightCommand::from(&HueSaturation::create(240, 75).unwrap()));
        assert_eq!(
            state.to_data_points(),
            data(json!({"1": 255, "2": 0, "4": 1000, "5": 240, "6": 750}))
        );
        assert!(state.temp().is_none());

        state.apply_command(&on_with_brightness(255));
        assert_eq!(state.color_mode(), Some(ColorMode::HueSaturation));
        assert_eq!(state.hue_saturation().unwrap().hue(), 240);

        state.apply_command(&LightCommand::from(&Kelvin::create(6500).unwrap()));
        assert_eq!(
            state.to_data_points(),
            data(json!({"1": 255, "2": 0, "3": 1000, "4": 1000}))
        );
        assert!(state.hue_saturation().is_none());
    }

    #[test]
    fn test_push_overwrites_optimistic_brightness() {
        let mut state = LightState::new();
        state.apply_command(&on_with_brightness(80));
        assert_eq!(state.brightness().unwrap().value(), 80);

        state.apply_data_points(&data(json!({"4": 235})));
        assert_eq!(state.brightness().unwrap().value(), 60);
        assert!(state.is_on());
    }

    #[test]
    fn test_push_ignores_unused_channels() {
        let mut state = LightState::new();
        state.apply_data_points(&data(json!({
            "1": 255, "3": 65535, "4": 500, "5": 65535, "6": 65535
        })));
        assert_eq!(state.brightness().unwrap().value(), 128);
        assert!(state.temp().is_none());
        assert!(state.hue_saturation().is_none());
        assert!(state.color_mode().is_none());
    }

    #[test]
    fn test_push_infers_colour_mode() {
        let mut state = LightState::new();
        state.apply_data_points(&data(json!({"5": 120, "6": 1000})));
        assert_eq!(state.color_mode(), Some(ColorMode::HueSaturation));

        state.apply_data_points(&data(json!({"6": 500})));
        assert_eq!(state.hue_saturation(), HueSaturation::create(120, 50));

        state.apply_data_points(&data(json!({"3": 0})));
        assert_eq!(state.color_mode(), Some(ColorMode::ColorTemp));
        assert_eq!(state.temp().unwrap().kelvin(), 2000);

        // A full report keeps whichever mode is active.
        state.apply_data_points(&data(json!({"3": 500, "5": 10, "6": 10})));
        assert_eq!(state.color_mode(), Some(ColorMode::ColorTemp));
    }

    #[test]
    fn test_features_from_query_reply() {
        let frame = Frame {
            command: CommandType::Query,
            sn: "1".to_string(),
            attrs: vec![1, 2, 4],
            data: data(json!({"1": 0, "2": 0, "4": 1000})),
            info: None,
            result: Some(0),
        };
        let mut state = LightState::new();
        state.apply_frame(&frame);
        assert_eq!(state.features().unwrap().color_modes(), vec![ColorMode::Brightness]);
        assert_eq!(state.power(), Some(PowerMode::Off));

        state.apply_command(&LightCommand::turn_on());
        assert_eq!(state.color_mode(), Some(ColorMode::Brightness));
        assert_eq!(state.to_data_points(), data(json!({"1": 255, "2": 0, "4": 1000})));
    }

    #[test]
    fn test_on_off_light_sends_no_brightness() {
        let mut state = LightState::new();
        state.set_features(LightFeatures::from_dpids([1]));
        state.apply_command(&on_with_brightness(40));
        assert_eq!(state.color_mode(), Some(ColorMode::OnOff));
        assert_eq!(state.to_data_points(), data(json!({"1": 255, "2": 0})));
    }
}
