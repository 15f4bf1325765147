//! Battery energy storage units.
//!
//! A unit reports its three outputs as one bitmask on DPID 1 and a handful
//! of sensors on other DPIDs. Output commands go through the bitmask
//! translator so callers can flip one output without touching the others.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::bitmask::{Output, OutputOverrides, Outputs, decode_outputs, encode_outputs};
use crate::codec::DataPointMap;
use crate::device::dpid;
use crate::errors::Error;
use crate::reconciler::{Reconcile, Tracker};
use crate::session::DeviceSession;
use crate::types::LedMode;

type Result<T> = std::result::Result<T, Error>;

/// Last known readings of an energy storage unit.
#[serde_with::skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct EnergyState {
    outputs: Option<u32>,
    battery_percent: Option<u32>,
    output_power: Option<u32>,
    input_power: Option<u32>,
    time_remaining: Option<u32>,
    led_mode: Option<LedMode>,
    max_output: Option<u32>,
    capacity: Option<u32>,
}

impl EnergyState {
    /// The raw DPID 1 mask.
    pub fn raw_outputs(&self) -> Option<u32> {
        self.outputs
    }

    pub fn outputs(&self) -> Option<Outputs> {
        self.outputs.map(decode_outputs)
    }

    pub fn output(&self, output: Output) -> Option<bool> {
        self.outputs().map(|outputs| outputs.get(output))
    }

    /// Charge level, percent.
    pub fn battery_percent(&self) -> Option<u32> {
        self.battery_percent
    }

    /// Watts drawn from the unit.
    pub fn output_power(&self) -> Option<u32> {
        self.output_power
    }

    /// Watts charging the unit.
    pub fn input_power(&self) -> Option<u32> {
        self.input_power
    }

    /// Estimated runtime left at the current draw.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.time_remaining
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
    }

    pub fn led_mode(&self) -> Option<LedMode> {
        self.led_mode
    }

    pub fn max_output(&self) -> Option<u32> {
        self.max_output
    }

    /// Battery capacity, watt hours.
    pub fn capacity(&self) -> Option<u32> {
        self.capacity
    }
}

impl Reconcile for EnergyState {
    fn apply_data_points(&mut self, data: &DataPointMap) {
        let fields = [
            (dpid::ENERGY_OUTPUTS, &mut self.outputs),
            (dpid::ENERGY_BATTERY_PERCENT, &mut self.battery_percent),
            (dpid::ENERGY_OUTPUT_POWER, &mut self.output_power),
            (dpid::ENERGY_TIME_REMAINING, &mut self.time_remaining),
            (dpid::ENERGY_INPUT_POWER, &mut self.input_power),
            (dpid::ENERGY_MAX_OUTPUT, &mut self.max_output),
            (dpid::ENERGY_CAPACITY, &mut self.capacity),
        ];
        for (dpid, field) in fields {
            if let Some(value) = data.get_u32(dpid) {
                *field = Some(value);
            }
        }
        if let Some(raw) = data.get_u32(dpid::ENERGY_LED_MODE) {
            match LedMode::create(raw) {
                Some(mode) => self.led_mode = Some(mode),
                None => debug!("Ignoring unknown LED mode {raw}"),
            }
        }
    }
}

/// A CozyLife energy storage unit.
///
/// Successful commands are folded into [`state`](Self::state) immediately,
/// so two toggles in a row build on each other without waiting for a push.
#[derive(Debug)]
pub struct EnergyStorage {
    tracker: Tracker<EnergyState>,
}

impl EnergyStorage {
    pub fn new(session: DeviceSession) -> Self {
        EnergyStorage {
            tracker: Tracker::attach(session),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        self.tracker.session()
    }

    pub fn name(&self) -> String {
        self.session().descriptor().display_name()
    }

    pub fn state(&self) -> EnergyState {
        self.tracker.snapshot()
    }

    /// Switch one output, leaving the others as they are.
    pub fn set_output(&self, output: Output, on: bool) -> Result<()> {
        self.set_outputs(OutputOverrides::new().with(output, on))
    }

    /// Apply several output changes in one command.
    ///
    /// An unknown current mask counts as everything off. Empty overrides send
    /// nothing.
    pub fn set_outputs(&self, overrides: OutputOverrides) -> Result<()> {
        if overrides.is_empty() {
            return Ok(());
        }
        let mut state = self.tracker.lock();
        let mask = encode_outputs(state.outputs.unwrap_or(0), overrides);
        self.session()
            .set(&DataPointMap::new().with(dpid::ENERGY_OUTPUTS, mask))?;
        state.outputs = Some(mask);
        Ok(())
    }

    /// Select the lamp mode. The lamp must be switched on first.
    pub fn set_led_mode(&self, mode: LedMode) -> Result<()> {
        if mode == LedMode::Auto {
            return Err(Error::Unsupported(
                "the Auto LED mode cannot be selected".to_string(),
            ));
        }
        let mut state = self.tracker.lock();
        if state.output(Output::Led) != Some(true) {
            return Err(Error::Unsupported(format!(
                "LED mode {mode} requires the LED lamp to be on"
            )));
        }
        self.session()
            .set(&DataPointMap::new().with(dpid::ENERGY_LED_MODE, mode.id()))?;
        state.led_mode = Some(mode);
        Ok(())
    }

    /// Ask the unit to report its readings. The reply arrives as a frame.
    pub fn refresh(&self) -> Result<()> {
        self.session().request_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data(value: serde_json::Value) -> DataPointMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_fold_readings() {
        let mut state = EnergyState::default();
        state.apply_data_points(&data(json!({
            "1": 5, "3": 87, "4": 120, "30": 95, "32": 0, "33": 8, "40": 600, "41": 512,
        })));
        assert_eq!(state.outputs(), Some(decode_outputs(5)));
        assert_eq!(state.output(Output::Led), Some(false));
        assert_eq!(state.battery_percent(), Some(87));
        assert_eq!(state.output_power(), Some(120));
        assert_eq!(state.time_remaining(), Some(Duration::from_secs(95 * 60)));
        assert_eq!(state.led_mode(), Some(LedMode::Auto));
        assert_eq!(state.capacity(), Some(512));

        state.apply_data_points(&data(json!({"4": 0, "33": 42})));
        assert_eq!(state.output_power(), Some(0));
        assert_eq!(state.battery_percent(), Some(87));
        assert_eq!(state.led_mode(), Some(LedMode::Auto));
    }

    #[test]
    fn test_led_mode_requires_lamp() {
        use crate::config::SessionConfig;
        use crate::device::DeviceDescriptor;

        let descriptor = DeviceDescriptor::new("unit", std::net::Ipv4Addr::LOCALHOST);
        let storage = EnergyStorage::new(DeviceSession::new(descriptor, SessionConfig::default()));
        assert!(matches!(
            storage.set_led_mode(LedMode::High),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            storage.set_led_mode(LedMode::Auto),
            Err(Error::Unsupported(_))
        ));
        assert_eq!(
            storage.set_output(Output::Ac, true),
            Err(Error::not_connected("unit"))
        );
        assert_eq!(storage.state().raw_outputs(), None);
        assert_eq!(storage.set_outputs(OutputOverrides::new()), Ok(()));
    }

    #[cfg(feature = "runtime-tokio")]
    mod live {
        use super::*;
        use crate::config::SessionConfig;
        use crate::testing::{FakeDevice, wait_for};

        #[tokio::test]
        async fn test_toggles_compose() {
            let device = FakeDevice::bind().await;
            let session =
                DeviceSession::new(device.descriptor("unit", None), SessionConfig::default());
            let storage = EnergyStorage::new(session.clone());
            session.start().unwrap();
            let mut conn = device.accept().await;
            conn.push(json!({"1": 1, "3": 50})).await;
            assert!(wait_for(|| storage.state().raw_outputs() == Some(1)).await);

            storage.set_output(Output::Dc12v, true).unwrap();
            storage.set_output(Output::Led, true).unwrap();
            storage.set_led_mode(LedMode::Sos).unwrap();
            storage.set_output(Output::Ac, false).unwrap();

            let mut sent = Vec::new();
            for _ in 0..4 {
                sent.push(conn.expect_command(3).await["msg"]["data"].clone());
            }
            assert_eq!(
                sent,
                vec![json!({"1": 5}), json!({"1": 7}), json!({"33": 5}), json!({"1": 6})]
            );
            let state = storage.state();
            assert_eq!(state.raw_outputs(), Some(6));
            assert_eq!(state.led_mode(), Some(LedMode::Sos));
            assert_eq!(state.battery_percent(), Some(50));
        }
    }
}
