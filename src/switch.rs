//! Switches and smart plugs.

use serde::{Deserialize, Serialize};

use crate::codec::DataPointMap;
use crate::device::dpid;
use crate::errors::Error;
use crate::reconciler::{Reconcile, Tracker};
use crate::session::DeviceSession;
use crate::types::PowerMode;

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
pub struct SwitchState {
    power: Option<PowerMode>,
}

impl SwitchState {
    pub fn power(&self) -> Option<PowerMode> {
        self.power
    }

    pub fn is_on(&self) -> bool {
        self.power.is_some_and(|power| power.is_on())
    }
}

impl Reconcile for SwitchState {
    fn apply_data_points(&mut self, data: &DataPointMap) {
        if let Some(raw) = data.get_u32(dpid::SWITCH) {
            self.power = Some(PowerMode::from_device(raw));
        }
    }
}

/// A CozyLife switch or plug.
///
/// Unlike [`Light`](crate::Light), a switch only records a new power state
/// once the command is on its way, so a disconnected switch reports
/// [`Error::NotConnected`] and keeps its last known state.
#[derive(Debug)]
pub struct Switch {
    tracker: Tracker<SwitchState>,
}

impl Switch {
    pub fn new(session: DeviceSession) -> Self {
        Switch {
            tracker: Tracker::attach(session),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        self.tracker.session()
    }

    pub fn name(&self) -> String {
        self.session().descriptor().display_name()
    }

    pub fn state(&self) -> SwitchState {
        self.tracker.snapshot()
    }

    pub fn is_on(&self) -> bool {
        self.state().is_on()
    }

    pub fn set_power(&self, power: &PowerMode) -> Result<()> {
        let mut state = self.tracker.lock();
        let data = DataPointMap::new().with(dpid::SWITCH, power.to_device());
        self.session().set(&data)?;
        state.power = Some(*power);
        Ok(())
    }

    pub fn turn_on(&self) -> Result<()> {
        self.set_power(&PowerMode::On)
    }

    pub fn turn_off(&self) -> Result<()> {
        self.set_power(&PowerMode::Off)
    }

    pub fn toggle(&self) -> Result<()> {
        if self.is_on() {
            self.turn_off()
        } else {
            self.turn_on()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::device::DeviceDescriptor;
    use std::net::Ipv4Addr;

    #[test]
    fn test_any_non_zero_is_on() {
        let mut state = SwitchState::default();
        state.apply_data_points(&DataPointMap::new().with(dpid::SWITCH, 1));
        assert!(state.is_on());
        state.apply_data_points(&DataPointMap::new().with(dpid::SWITCH, 0));
        assert_eq!(state.power(), Some(PowerMode::Off));
    }

    #[test]
    fn test_disconnected_switch_keeps_state() {
        let descriptor = DeviceDescriptor::new("plug", Ipv4Addr::LOCALHOST);
        let switch = Switch::new(DeviceSession::new(descriptor, SessionConfig::default()));
        assert_eq!(switch.turn_on(), Err(Error::not_connected("plug")));
        assert_eq!(switch.state().power(), None);
    }

    #[cfg(feature = "runtime-tokio")]
    #[tokio::test]
    async fn test_toggle_round_trip() {
        use crate::testing::{FakeDevice, wait_for};
        use serde_json::json;

        let device = FakeDevice::bind().await;
        let session =
            DeviceSession::new(device.descriptor("plug", None), SessionConfig::default());
        let switch = Switch::new(session.clone());
        session.start().unwrap();
        let mut conn = device.accept().await;
        conn.push(json!({"1": 255})).await;
        assert!(wait_for(|| switch.is_on()).await);

        switch.toggle().unwrap();
        assert!(!switch.is_on());
        let set = conn.expect_command(3).await;
        assert_eq!(set["msg"], json!({"attr": [1], "data": {"1": 0}}));
    }
}
