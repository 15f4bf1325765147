//! Optimistic control of a CozyLife light.

use log::debug;
use serde_json::{Value, json};

use crate::codec::DataPointMap;
use crate::device::DeviceDescriptor;
use crate::errors::Error;
use crate::payload::LightCommand;
use crate::reconciler::{Delivery, Reconcile, Tracker};
use crate::session::DeviceSession;
use crate::status::{LightFeatures, LightState};
use crate::types::{Brightness, Color, HueSaturation, Kelvin, PowerMode};

type Result<T> = std::result::Result<T, Error>;

impl Reconcile for LightState {
    fn apply_data_points(&mut self, data: &DataPointMap) {
        LightState::apply_data_points(self, data);
    }

    fn apply_frame(&mut self, frame: &crate::codec::Frame) {
        LightState::apply_frame(self, frame);
    }

    fn seed(&mut self, cache: &DataPointMap) {
        if !cache.is_empty() {
            self.set_features(LightFeatures::from_dpids(cache.dpids()));
        }
        LightState::apply_data_points(self, cache);
    }
}

/// A CozyLife light on top of a [`DeviceSession`].
///
/// Commands update [`state`](Self::state) the moment they are issued and are
/// sent without waiting for an acknowledgement. Frames from the device
/// overwrite the optimistic guess.
///
/// # Example
///
/// ```
/// use std::net::Ipv4Addr;
/// use cozylife_local::{
///     Brightness, Delivery, DeviceDescriptor, DeviceSession, Light, LightCommand, SessionConfig,
/// };
///
/// let descriptor = DeviceDescriptor::new("629168597cb94c4c1d8f", Ipv4Addr::new(192, 168, 1, 57));
/// let light = Light::new(DeviceSession::new(descriptor, SessionConfig::default()));
///
/// let mut command = LightCommand::turn_on();
/// command.brightness(&Brightness::create(80).unwrap());
///
/// // Not started, so nothing goes out, but the state follows the command.
/// assert_eq!(light.set(&command).unwrap(), Delivery::Undelivered);
/// assert_eq!(light.state().brightness().unwrap().value(), 80);
/// ```
#[derive(Debug)]
pub struct Light {
    tracker: Tracker<LightState>,
}

impl Light {
    pub fn new(session: DeviceSession) -> Self {
        Light {
            tracker: Tracker::attach(session),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        self.tracker.session()
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        self.session().descriptor()
    }

    pub fn serial(&self) -> &str {
        self.session().serial()
    }

    /// Alias if configured, else a name derived from the serial number.
    pub fn name(&self) -> String {
        self.descriptor().display_name()
    }

    pub fn state(&self) -> LightState {
        self.tracker.snapshot()
    }

    pub fn is_available(&self) -> bool {
        self.session().state().is_connected()
    }

    /// Apply a command locally and send it to the light.
    ///
    /// A disconnected light still takes the new state and the call returns
    /// [`Delivery::Undelivered`]. Any other failure leaves the state alone.
    pub fn set(&self, command: &LightCommand) -> Result<Delivery> {
        let mut state = self.tracker.lock();
        let mut next = state.clone();
        next.apply_command(command);

        let data = next.to_data_points();
        debug!("{}: setting {:?}", self.serial(), data);
        let delivery = Delivery::from_send(self.session().set(&data))?;
        *state = next;
        Ok(delivery)
    }

    pub fn turn_on(&self) -> Result<Delivery> {
        self.set(&LightCommand::turn_on())
    }

    pub fn turn_off(&self) -> Result<Delivery> {
        self.set(&LightCommand::turn_off())
    }

    pub fn set_power(&self, power: &PowerMode) -> Result<Delivery> {
        self.set(&LightCommand::from(power))
    }

    /// Flip the power based on the last known state. Unknown counts as off.
    pub fn toggle(&self) -> Result<Delivery> {
        if self.state().is_on() {
            self.turn_off()
        } else {
            self.turn_on()
        }
    }

    pub fn set_brightness(&self, brightness: &Brightness) -> Result<Delivery> {
        self.set(&LightCommand::from(brightness))
    }

    pub fn set_color(&self, color: &Color) -> Result<Delivery> {
        self.set(&LightCommand::from(color))
    }

    pub fn set_hue_saturation(&self, hs: &HueSaturation) -> Result<Delivery> {
        self.set(&LightCommand::from(hs))
    }

    pub fn set_temp(&self, kelvin: &Kelvin) -> Result<Delivery> {
        self.set(&LightCommand::from(kelvin))
    }

    /// Ask the light to report its state. The reply arrives as a frame.
    pub fn refresh(&self) -> Result<()> {
        self.session().request_state()
    }

    /// Session diagnostics plus the tracked light state.
    pub fn diagnostics(&self) -> Value {
        let state = self.state();
        let mut diag = self.session().diagnostics();
        diag["light"] = json!({
            "name": self.name(),
            "state": state,
            "color": state.color().map(|c| format!("{},{},{}", c.red(), c.green(), c.blue())),
            "color_modes": state.features().map(|f| f.color_modes()),
        });
        diag
    }
}
