//! Keeps local entity state in step with what devices report.
//!
//! Each entity handle ([`Light`], [`Switch`], [`EnergyStorage`]) attaches a
//! [`Tracker`] to its session. The tracker seeds itself from the session's
//! cache and then folds every frame the device sends, so whatever the device
//! reports last wins over anything the handle assumed.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use log::debug;
use serde::Serialize;

use crate::codec::{DataPointMap, Frame};
use crate::device::DeviceType;
use crate::energy::{EnergyState, EnergyStorage};
use crate::errors::Error;
use crate::light::Light;
use crate::runtime;
use crate::session::DeviceSession;
use crate::status::LightState;
use crate::subscription::SubscriptionId;
use crate::switch::{Switch, SwitchState};

type Result<T> = std::result::Result<T, Error>;

/// Entity state that can be rebuilt from device frames.
pub(crate) trait Reconcile: Default + Send + 'static {
    fn apply_data_points(&mut self, data: &DataPointMap);

    fn apply_frame(&mut self, frame: &Frame) {
        if frame.carries_state() {
            self.apply_data_points(&frame.data);
        }
    }

    /// Start from the data points the session has already cached.
    fn seed(&mut self, cache: &DataPointMap) {
        self.apply_data_points(cache);
    }
}

/// Entity state bound to a session's inbound frames.
///
/// Dropping the tracker unsubscribes it.
pub(crate) struct Tracker<S: Reconcile> {
    session: DeviceSession,
    state: Arc<Mutex<S>>,
    subscription: SubscriptionId,
}

impl<S: Reconcile> Tracker<S> {
    pub fn attach(session: DeviceSession) -> Self {
        let state = Arc::new(Mutex::new(S::default()));
        let sink = Arc::clone(&state);
        let subscription = session.subscribe(move |_, frame| {
            lock(&sink).apply_frame(frame);
        });

        // The cache already holds every frame delivered before the subscription,
        // and frames delivered since then are merged into it too.
        {
            let mut state = lock(&state);
            state.seed(&session.query());
        }

        Tracker {
            session,
            state,
            subscription,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        lock(&self.state)
    }
}

impl<S: Reconcile + Clone> Tracker<S> {
    pub fn snapshot(&self) -> S {
        self.lock().clone()
    }
}

impl<S: Reconcile> Drop for Tracker<S> {
    fn drop(&mut self) {
        self.session.unsubscribe(self.subscription);
    }
}

impl<S: Reconcile> std::fmt::Debug for Tracker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("session", &self.session)
            .field("subscription", &self.subscription)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether a command reached the device's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// Queued on a live connection.
    Sent,
    /// The session was not connected. The local state changed anyway.
    Undelivered,
}

impl Delivery {
    /// Map a send result, treating [`Error::NotConnected`] as undelivered.
    pub(crate) fn from_send(result: Result<()>) -> Result<Self> {
        match result {
            Ok(()) => Ok(Delivery::Sent),
            Err(Error::NotConnected(serial)) => {
                debug!("{serial}: not connected, keeping optimistic state");
                Ok(Delivery::Undelivered)
            }
            Err(e) => Err(e),
        }
    }
}

/// The entity handle matching a session's device class.
#[derive(Debug)]
pub enum Device {
    Light(Light),
    Switch(Switch),
    EnergyStorage(EnergyStorage),
    /// A class this crate has no handle for. Raw data points only.
    Other(DeviceSession),
}

/// State snapshot of any [`Device`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DeviceState {
    Light(LightState),
    Switch(SwitchState),
    EnergyStorage(EnergyState),
    Other(DataPointMap),
}

impl Device {
    /// Pick a handle from the configured or reported device type.
    ///
    /// Sessions whose type is not yet known become [`Device::Other`]; see
    /// [`identify`] to wait for the INFO reply first.
    pub fn attach(session: DeviceSession) -> Self {
        match session.device_type() {
            Some(DeviceType::Light) => Device::Light(Light::new(session)),
            Some(DeviceType::Switch) => Device::Switch(Switch::new(session)),
            Some(DeviceType::EnergyStorage) => Device::EnergyStorage(EnergyStorage::new(session)),
            _ => Device::Other(session),
        }
    }

    pub fn session(&self) -> &DeviceSession {
        match self {
            Device::Light(light) => light.session(),
            Device::Switch(switch) => switch.session(),
            Device::EnergyStorage(storage) => storage.session(),
            Device::Other(session) => session,
        }
    }

    pub fn serial(&self) -> &str {
        self.session().serial()
    }

    pub fn is_available(&self) -> bool {
        self.session().state().is_connected()
    }

    pub fn state(&self) -> DeviceState {
        match self {
            Device::Light(light) => DeviceState::Light(light.state()),
            Device::Switch(switch) => DeviceState::Switch(switch.state()),
            Device::EnergyStorage(storage) => DeviceState::EnergyStorage(storage.state()),
            Device::Other(session) => DeviceState::Other(session.query()),
        }
    }
}

/// Device type of a session, waiting up to `within` for its INFO reply.
pub async fn identify(session: &DeviceSession, within: Duration) -> Option<DeviceType> {
    // Subscribe before checking so a reply landing in between is not missed.
    let mut frames = session.frames();
    if let Some(device_type) = session.device_type() {
        return Some(device_type);
    }

    let wait = async {
        while let Some(frame) = frames.next().await {
            if let Some(device_type) = frame.info.and_then(|info| info.device_type) {
                return Some(device_type);
            }
        }
        None
    };
    match runtime::timeout(within, wait).await {
        Ok(found) => found,
        Err(_) => {
            debug!("{}: no INFO reply within {within:?}", session.serial());
            session.device_type()
        }
    }
}
