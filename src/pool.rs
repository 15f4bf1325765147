//! The set of device sessions, keyed by serial number.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt, future};
use log::{debug, info, warn};

use crate::codec::{CommandType, DataPointMap, Frame};
use crate::config::{ClientConfig, DeviceEntry, SessionConfig};
use crate::device::DeviceDescriptor;
use crate::discovery::DiscoveryEvent;
use crate::errors::Error;
use crate::session::{ConnectionState, DeviceSession};
use crate::subscription::{Subscribers, SubscriptionId};

type Result<T> = std::result::Result<T, Error>;

#[derive(Default)]
struct Registry {
    sessions: HashMap<String, DeviceSession>,
    stopped: bool,
}

/// Owns one [`DeviceSession`] per device and routes commands to them.
///
/// Sessions run independently: an unreachable device sits in its own
/// backoff loop without holding up the others. Dropping the pool stops
/// every session.
pub struct SessionPool {
    config: SessionConfig,
    registry: Mutex<Registry>,
    subscribers: Arc<Subscribers>,
}

impl SessionPool {
    pub fn new(config: SessionConfig) -> Self {
        SessionPool {
            config,
            registry: Mutex::new(Registry::default()),
            subscribers: Arc::new(Subscribers::new()),
        }
    }

    /// Build a pool and start a session for every configured device that
    /// names its serial number. See [`load`](Self::load) for the others.
    ///
    /// Must be called from within the async runtime.
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let pool = SessionPool::new(config.session.clone());
        for descriptor in config.descriptors() {
            pool.add_device(descriptor)?;
        }
        let unresolved = config.devices.len() - pool.len();
        if unresolved > 0 {
            debug!("{unresolved} configured devices have no serial number yet");
        }
        Ok(pool)
    }

    /// Like [`from_config`](Self::from_config), but first asks devices
    /// configured by address alone for their serial number.
    ///
    /// A device that does not answer within the connect timeout is skipped
    /// with a warning; the others are added regardless.
    pub async fn load(config: &ClientConfig) -> Result<Self> {
        let pool = SessionPool::new(config.session.clone());
        let within = config.session.connect_timeout;
        let resolved = future::join_all(config.devices.iter().map(|entry| async move {
            (entry, entry.resolve(within).await)
        }))
        .await;

        for (entry, result) in resolved {
            match result {
                Ok(descriptor) => {
                    pool.add_device(descriptor)?;
                }
                Err(e) => warn!("Skipping device at {}:{}: {e}", entry.ip, entry.port),
            }
        }
        Ok(pool)
    }

    /// Resolve `entry` if needed, then [`add_device`](Self::add_device).
    pub async fn add_entry(&self, entry: &DeviceEntry) -> Result<DeviceSession> {
        let descriptor = entry.resolve(self.config.connect_timeout).await?;
        self.add_device(descriptor)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create and start a session unless one exists for this serial.
    ///
    /// Returns the session for the serial, new or existing.
    pub fn add_device(&self, descriptor: DeviceDescriptor) -> Result<DeviceSession> {
        let mut registry = self.lock();
        if registry.stopped {
            return Err(Error::SessionStopped(descriptor.serial().to_string()));
        }
        if let Some(existing) = registry.sessions.get(descriptor.serial()) {
            return Ok(existing.clone());
        }

        let serial = descriptor.serial().to_string();
        let session = DeviceSession::new(descriptor, self.config.clone());
        let subscribers = Arc::clone(&self.subscribers);
        session.subscribe(move |serial, frame| {
            subscribers.dispatch(serial, frame);
        });
        session.start()?;

        info!("Added device {serial}");
        registry.sessions.insert(serial, session.clone());
        Ok(session)
    }

    /// Stop and discard the session for `serial`. Returns `false` if there was none.
    pub fn remove_device(&self, serial: &str) -> bool {
        let Some(session) = self.lock().sessions.remove(serial) else {
            return false;
        };
        session.stop();
        info!("Removed device {serial}");
        true
    }

    pub fn session(&self, serial: &str) -> Option<DeviceSession> {
        self.lock().sessions.get(serial).cloned()
    }

    /// Route a command to the session for `serial`.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::{CommandType, DataPointMap, Error, SessionConfig, SessionPool};
    ///
    /// let pool = SessionPool::new(SessionConfig::default());
    /// let result = pool.dispatch("nope", CommandType::Set, &DataPointMap::new().with(1, 0));
    /// assert!(matches!(result, Err(Error::UnknownDevice(_))));
    /// ```
    pub fn dispatch(&self, serial: &str, command: CommandType, data: &DataPointMap) -> Result<()> {
        let session = self
            .session(serial)
            .ok_or_else(|| Error::unknown_device(serial))?;
        session.send(command, data)
    }

    /// Register a callback for frames from every device, current and future.
    ///
    /// Callbacks run on the sending device's connection task. They may call
    /// back into the pool, for example to remove that device.
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Frame) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    pub fn serials(&self) -> Vec<String> {
        let mut serials: Vec<String> = self.lock().sessions.keys().cloned().collect();
        serials.sort();
        serials
    }

    pub fn states(&self) -> HashMap<String, ConnectionState> {
        self.lock()
            .sessions
            .iter()
            .map(|(serial, session)| (serial.clone(), session.state()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().sessions.is_empty()
    }

    /// Add every device a discovery run reports, until it ends.
    ///
    /// Repeated reports of a known serial are ignored. A failed listener
    /// ends the loop with its error.
    pub async fn follow<S>(&self, events: S) -> Result<()>
    where
        S: Stream<Item = DiscoveryEvent>,
    {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match event {
                DiscoveryEvent::Found(descriptor) => {
                    if self.session(descriptor.serial()).is_none() {
                        self.add_device(descriptor)?;
                    }
                }
                DiscoveryEvent::Failed(e) => return Err(e),
            }
        }
        debug!("Discovery stream ended");
        Ok(())
    }

    /// Stop every session. The pool accepts no devices afterwards.
    pub fn stop(&self) {
        let sessions: Vec<DeviceSession> = {
            let mut registry = self.lock();
            registry.stopped = true;
            registry.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in &sessions {
            session.stop();
        }
        self.subscribers.close();
        if !sessions.is_empty() {
            info!("Stopped {} device sessions", sessions.len());
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_device() {
        let pool = SessionPool::new(SessionConfig::default());
        assert_eq!(
            pool.dispatch("ghost", CommandType::Set, &DataPointMap::new().with(1, 0)),
            Err(Error::unknown_device("ghost"))
        );
        assert!(!pool.remove_device("ghost"));
    }

    #[test]
    fn test_add_after_stop() {
        let pool = SessionPool::new(SessionConfig::default());
        pool.stop();
        let descriptor = DeviceDescriptor::new("late", std::net::Ipv4Addr::LOCALHOST);
        assert!(matches!(
            pool.add_device(descriptor),
            Err(Error::SessionStopped(_))
        ));
    }

    #[cfg(feature = "runtime-tokio")]
    mod live {
        use super::*;
        use crate::device::DeviceType;
        use crate::testing::{FakeDevice, refused_descriptor, wait_for};
        use serde_json::json;
        use std::net::Ipv4Addr;
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::{Duration, Instant};

        #[tokio::test]
        async fn test_add_device_is_idempotent() {
            let pool = SessionPool::new(SessionConfig::default());
            let first = pool.add_device(refused_descriptor("dup")).unwrap();
            let second = pool.add_device(refused_descriptor("dup")).unwrap();

            assert_eq!(pool.len(), 1);
            assert_eq!(first.descriptor(), second.descriptor());

            assert!(pool.remove_device("dup"));
            assert!(first.is_stopped());
            assert!(pool.is_empty());
        }

        #[tokio::test]
        async fn test_unreachable_device_does_not_block_others() {
            let device = FakeDevice::bind().await;
            let pool = SessionPool::new(SessionConfig::default());

            let dead = pool.add_device(refused_descriptor("dead")).unwrap();
            pool.add_device(device.descriptor("alive", None)).unwrap();

            let mut conn = device.accept().await;
            assert!(wait_for(|| dead.state() == ConnectionState::Backoff).await);
            assert!(wait_for(|| pool.states()["alive"] == ConnectionState::Connected).await);

            let started = Instant::now();
            pool.dispatch("alive", CommandType::Set, &DataPointMap::new().with(1, 255))
                .unwrap();
            assert_eq!(
                pool.dispatch("dead", CommandType::Set, &DataPointMap::new().with(1, 255)),
                Err(Error::not_connected("dead"))
            );
            assert!(started.elapsed() < Duration::from_millis(100));

            let set = conn.expect_command(3).await;
            assert_eq!(set["msg"]["data"]["1"], json!(255));
            assert_eq!(dead.state(), ConnectionState::Backoff);
        }

        #[tokio::test]
        async fn test_subscribers_see_every_device() {
            let first = FakeDevice::bind().await;
            let second = FakeDevice::bind().await;
            let pool = SessionPool::new(SessionConfig::default());

            let seen = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&seen);
            pool.subscribe(move |serial, frame| {
                if frame.command == CommandType::Push {
                    sink.lock().unwrap().push(serial.to_string());
                }
            });

            pool.add_device(first.descriptor("a", None)).unwrap();
            pool.add_device(second.descriptor("b", None)).unwrap();
            let mut a = first.accept().await;
            let mut b = second.accept().await;
            a.push(json!({"1": 0})).await;
            b.push(json!({"1": 255})).await;

            assert!(wait_for(|| seen.lock().unwrap().len() == 2).await);
            let mut serials = seen.lock().unwrap().clone();
            serials.sort();
            assert_eq!(serials, vec!["a", "b"]);
        }

        #[tokio::test]
        async fn test_follow_discovery() {
            let device = FakeDevice::bind().await;
            let pool = SessionPool::new(SessionConfig::default());
            let found = device.descriptor("disc", None);

            let events = futures::stream::iter(vec![
                DiscoveryEvent::Found(found.clone()),
                DiscoveryEvent::Found(found),
            ]);
            pool.follow(events).await.unwrap();
            assert_eq!(pool.serials(), vec!["disc".to_string()]);
            let _conn = device.accept().await;

            let failed = futures::stream::iter(vec![DiscoveryEvent::Failed(
                Error::DiscoveryFailed("no broadcast".to_string()),
            )]);
            assert!(pool.follow(failed).await.is_err());
        }

        #[tokio::test]
        async fn test_remove_device_from_callback() {
            let device = FakeDevice::bind().await;
            let pool = Arc::new(SessionPool::new(SessionConfig::default()));
            let handle = Arc::downgrade(&pool);
            pool.subscribe(move |serial, frame| {
                if frame.command == CommandType::Push {
                    if let Some(pool) = handle.upgrade() {
                        pool.remove_device(serial);
                    }
                }
            });

            let session = pool.add_device(device.descriptor("bye", None)).unwrap();
            let mut conn = device.accept().await;
            conn.push(json!({"1": 0})).await;

            assert!(wait_for(|| pool.is_empty()).await);
            assert!(session.is_stopped());
            conn.expect_closed().await;
        }

        #[tokio::test]
        async fn test_load_resolves_address_only_entries() {
            let known = FakeDevice::bind().await;
            let by_ip = FakeDevice::bind().await;
            let dead = refused_descriptor("dead");
            let config = ClientConfig {
                devices: vec![
                    DeviceEntry {
                        serial_number: Some("known".to_string()),
                        port: known.port(),
                        ..DeviceEntry::from_ip(Ipv4Addr::LOCALHOST)
                    },
                    DeviceEntry {
                        port: by_ip.port(),
                        ..DeviceEntry::from_ip(Ipv4Addr::LOCALHOST)
                    },
                    DeviceEntry {
                        port: dead.port(),
                        ..DeviceEntry::from_ip(Ipv4Addr::LOCALHOST)
                    },
                ],
                ..ClientConfig::default()
            };

            let answer = async {
                let mut conn = by_ip.accept().await;
                conn.expect_command(0).await;
                conn.send_info("learned", "01").await;
            };
            let (pool, ()) = tokio::join!(SessionPool::load(&config), answer);
            let pool = pool.unwrap();

            assert_eq!(pool.serials(), vec!["known".to_string(), "learned".to_string()]);
            assert_eq!(
                pool.session("learned").unwrap().descriptor().device_type(),
                Some(&DeviceType::Light)
            );
            let _known = known.accept().await;
            let _session = by_ip.accept().await;
        }

        #[tokio::test]
        async fn test_stop_tears_down_everything() {
            let device = FakeDevice::bind().await;
            let pool = SessionPool::new(SessionConfig::default());
            let session = pool.add_device(device.descriptor("x", None)).unwrap();
            let _conn = device.accept().await;

            let calls = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&calls);
            pool.subscribe(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            });

            pool.stop();
            assert!(session.is_stopped());
            assert!(pool.is_empty());
            assert_eq!(session.state(), ConnectionState::Disconnected);
            assert_eq!(calls.load(Ordering::SeqCst), 0);
        }
    }
}
