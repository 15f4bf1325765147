//! Persistent connection to one device.
//!
//! A [`DeviceSession`] owns one TCP connection and a background task that
//! keeps it alive:
//!
//! ```text
//! Disconnected --start()--> Connecting --success--> Connected
//! Connecting --failure--> Backoff --timer--> Connecting
//! Connected --socket error / peer close--> Backoff --timer--> Connecting
//! any --stop()--> Disconnected (terminal)
//! ```
//!
//! The backoff is a fixed delay, 60 seconds unless configured otherwise.
//! Every decoded frame, whether a reply or an unsolicited push, is handed to
//! subscribers in the order it arrived.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use futures::channel::mpsc::{self, TryRecvError};
use futures::channel::oneshot;
use futures::future::{Fuse, FutureExt};
use futures::{StreamExt, pin_mut};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::codec::{self, CommandType, DataPointMap, Frame, FrameDecoder};
use crate::config::SessionConfig;
use crate::device::{DeviceDescriptor, DeviceInfo, DeviceType};
use crate::errors::Error;
use crate::history::{Direction, MessageHistory};
use crate::runtime::{self, AsyncTcpStream, JoinHandle, TcpStream};
use crate::subscription::{FrameStream, Subscribers, SubscriptionId};

type Result<T> = std::result::Result<T, Error>;

const READ_BUFFER_SIZE: usize = 4096;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Backoff,
}

/// Inputs to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    Connected,
    ConnectFailed,
    ConnectionLost,
    BackoffElapsed,
    Stop,
}

impl ConnectionState {
    /// The state reached from `self` on `event`, or `None` if the event does
    /// not apply in this state.
    ///
    /// # Examples
    ///
    /// ```
    /// use cozylife_local::{ConnectionState, SessionEvent};
    ///
    /// let state = ConnectionState::Connected;
    /// assert_eq!(state.next(SessionEvent::ConnectionLost), Some(ConnectionState::Backoff));
    /// assert_eq!(state.next(SessionEvent::BackoffElapsed), None);
    /// ```
    pub fn next(self, event: SessionEvent) -> Option<ConnectionState> {
        use ConnectionState::*;

        match (self, event) {
            (_, SessionEvent::Stop) => Some(Disconnected),
            (Disconnected, SessionEvent::Start) => Some(Connecting),
            (Connecting, SessionEvent::Connected) => Some(Connected),
            (Connecting, SessionEvent::ConnectFailed) => Some(Backoff),
            (Connected, SessionEvent::ConnectionLost) => Some(Backoff),
            (Backoff, SessionEvent::BackoffElapsed) => Some(Connecting),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

#[derive(Debug)]
struct StateCell {
    current: ConnectionState,
    stopped: bool,
}

/// A command encoded and waiting for the connection task.
#[derive(Debug)]
struct Outgoing {
    command: CommandType,
    sn: String,
    data: DataPointMap,
    bytes: Vec<u8>,
}

impl Outgoing {
    fn new(command: CommandType, data: DataPointMap) -> Result<Self> {
        let sn = codec::next_sn();
        let bytes = codec::encode_with_sn(command, &data, &sn)?;
        Ok(Outgoing {
            command,
            sn,
            data,
            bytes,
        })
    }
}

/// State shared between the handles and the connection task.
#[derive(Debug)]
struct Shared {
    descriptor: DeviceDescriptor,
    config: SessionConfig,
    state: RwLock<StateCell>,
    subscribers: Subscribers,
    cache: Mutex<DataPointMap>,
    info: Mutex<Option<DeviceInfo>>,
    history: Mutex<MessageHistory>,
}

#[derive(Default)]
struct Control {
    receiver: Option<mpsc::UnboundedReceiver<Outgoing>>,
    stop: Option<oneshot::Sender<()>>,
    // Held so runtimes that cancel on drop keep the task alive.
    task: Option<JoinHandle<()>>,
}

struct Inner {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Outgoing>,
    control: Mutex<Control>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        halt(&self.shared, &self.control);
    }
}

/// Handle to the persistent connection with one device.
///
/// Cloning is cheap and every clone controls the same session. The session
/// stops when [`stop`](Self::stop) is called or the last handle is dropped.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("serial", &self.serial())
            .field("addr", &self.inner.shared.descriptor.socket_addr())
            .field("state", &self.state())
            .finish()
    }
}

impl DeviceSession {
    pub fn new(descriptor: DeviceDescriptor, config: SessionConfig) -> Self {
        let (commands, receiver) = mpsc::unbounded();
        let shared = Arc::new(Shared {
            descriptor,
            config,
            state: RwLock::new(StateCell {
                current: ConnectionState::Disconnected,
                stopped: false,
            }),
            subscribers: Subscribers::new(),
            cache: Mutex::new(DataPointMap::new()),
            info: Mutex::new(None),
            history: Mutex::new(MessageHistory::new()),
        });

        DeviceSession {
            inner: Arc::new(Inner {
                shared,
                commands,
                control: Mutex::new(Control {
                    receiver: Some(receiver),
                    ..Control::default()
                }),
            }),
        }
    }

    /// Spawn the connection task on the active runtime.
    ///
    /// Calling it again while running does nothing. A stopped session cannot
    /// be restarted and returns [`Error::SessionStopped`].
    pub fn start(&self) -> Result<()> {
        let mut control = lock(&self.inner.control);
        if self.is_stopped() {
            return Err(Error::SessionStopped(self.serial().to_string()));
        }
        let Some(receiver) = control.receiver.take() else {
            return Ok(());
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        control.stop = Some(stop_tx);
        self.inner.shared.transition(SessionEvent::Start);

        let shared = Arc::clone(&self.inner.shared);
        control.task = Some(runtime::spawn(run(shared, receiver, stop_rx)));
        Ok(())
    }

    /// Queue a command for the device.
    ///
    /// Returns as soon as the frame is queued; any reply arrives later as an
    /// ordinary frame. Fails with [`Error::Encode`] for an invalid map and
    /// [`Error::NotConnected`] unless the session is connected.
    pub fn send(&self, command: CommandType, data: &DataPointMap) -> Result<()> {
        let outgoing = Outgoing::new(command, data.clone())?;
        if !self.state().is_connected() {
            return Err(Error::not_connected(self.serial()));
        }
        self.inner
            .commands
            .unbounded_send(outgoing)
            .map_err(|_| Error::not_connected(self.serial()))
    }

    /// Write data points.
    pub fn set(&self, data: &DataPointMap) -> Result<()> {
        self.send(CommandType::Set, data)
    }

    /// Ask the device to report every data point.
    pub fn request_state(&self) -> Result<()> {
        self.send(CommandType::Query, &DataPointMap::new())
    }

    /// Last known value of every data point the device has reported.
    pub fn query(&self) -> DataPointMap {
        lock(&self.inner.shared.cache).clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.shared.read_state().current
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shared.read_state().stopped
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.shared.descriptor
    }

    pub fn serial(&self) -> &str {
        self.inner.shared.descriptor.serial()
    }

    /// INFO reply from the most recent connection.
    pub fn info(&self) -> Option<DeviceInfo> {
        lock(&self.inner.shared.info).clone()
    }

    /// Configured device type, else the one the device reported.
    pub fn device_type(&self) -> Option<DeviceType> {
        self.inner
            .shared
            .descriptor
            .device_type()
            .cloned()
            .or_else(|| self.info().and_then(|info| info.device_type))
    }

    /// Register a callback for every frame received from now on.
    ///
    /// Callbacks run on the connection task, so they should return quickly.
    /// They may call back into the session, including [`stop`](Self::stop).
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Frame) + Send + Sync + 'static,
    {
        self.inner.shared.subscribers.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.shared.subscribers.unsubscribe(id)
    }

    /// Frames received from now on, as a stream.
    pub fn frames(&self) -> FrameStream {
        self.inner.shared.subscribers.stream()
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.shared.subscribers.len()
    }

    pub fn history(&self) -> MessageHistory {
        lock(&self.inner.shared.history).clone()
    }

    pub fn clear_history(&self) {
        lock(&self.inner.shared.history).clear();
    }

    /// Returns diagnostics including state, device info, cached data points and history.
    pub fn diagnostics(&self) -> Value {
        let shared = &self.inner.shared;
        let history = lock(&shared.history).summary();
        json!({
            "serial": self.serial(),
            "address": shared.descriptor.socket_addr().to_string(),
            "device_type": self.device_type().map(|t| t.name().to_string()),
            "state": self.state(),
            "info": self.info(),
            "data_points": self.query(),
            "history": history,
        })
    }

    /// Close the connection and cancel any pending connect or backoff.
    ///
    /// Terminal: no callback fires after this returns.
    pub fn stop(&self) {
        halt(&self.inner.shared, &self.inner.control);
    }
}

fn halt(shared: &Shared, control: &Mutex<Control>) {
    let (stop, task) = {
        let mut control = lock(control);
        if shared.transition(SessionEvent::Stop) {
            control.receiver.take();
            (control.stop.take(), control.task.take())
        } else {
            (None, None)
        }
    };
    // Outside the control lock: a callback running on the connection task
    // may be calling stop() itself.
    shared.subscribers.close();
    if let Some(stop) = stop {
        let _ = stop.send(());
        debug!("Session for {} stopped", shared.descriptor.serial());
    }
    drop(task);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Served {
    Stopped,
    Lost(Error),
}

enum Event {
    Read(io::Result<usize>),
    Command(Option<Outgoing>),
    Stop,
}

impl Shared {
    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StateCell> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply an event. Returns `false` if it was ignored.
    fn transition(&self, event: SessionEvent) -> bool {
        let mut cell = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if cell.stopped {
            return false;
        }
        let Some(next) = cell.current.next(event) else {
            debug!(
                "{}: ignoring {:?} while {:?}",
                self.descriptor.serial(),
                event,
                cell.current
            );
            return false;
        };
        debug!(
            "{}: {:?} -> {:?}",
            self.descriptor.serial(),
            cell.current,
            next
        );
        cell.current = next;
        cell.stopped = event == SessionEvent::Stop;
        true
    }

    fn addr(&self) -> SocketAddr {
        self.descriptor.socket_addr()
    }

    fn record_error(&self, error: &Error) {
        lock(&self.history).record_error(&error.to_string());
    }

    async fn write(&self, stream: &mut TcpStream, outgoing: &Outgoing) -> Result<()> {
        stream
            .write_all(&outgoing.bytes)
            .await
            .map_err(|e| Error::socket("write", e))?;
        lock(&self.history).record(
            Direction::Send,
            outgoing.command,
            &outgoing.sn,
            &outgoing.data,
        );
        Ok(())
    }

    fn deliver(&self, frame: Frame) {
        lock(&self.history).record(Direction::Receive, frame.command, &frame.sn, &frame.data);

        if let Some(info) = &frame.info {
            debug!(
                "{}: device reports type {:?}, firmware {:?}",
                self.descriptor.serial(),
                info.device_type,
                info.software_version
            );
            *lock(&self.info) = Some(info.clone());
        }
        if frame.carries_state() {
            lock(&self.cache).merge(&frame.data);
        }

        self.subscribers.dispatch(self.descriptor.serial(), &frame);
    }

    /// Drive one open connection until it fails or the session stops.
    async fn serve(
        &self,
        mut stream: TcpStream,
        commands: &mut mpsc::UnboundedReceiver<Outgoing>,
        mut stop: &mut Fuse<oneshot::Receiver<()>>,
    ) -> Served {
        for command in [CommandType::Info, CommandType::Query] {
            let handshake = match Outgoing::new(command, DataPointMap::new()) {
                Ok(outgoing) => outgoing,
                Err(e) => return Served::Lost(e),
            };
            if let Err(e) = self.write(&mut stream, &handshake).await {
                return Served::Lost(e);
            }
        }

        let mut decoder = FrameDecoder::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let event = {
                let read = stream.read(&mut buffer).fuse();
                pin_mut!(read);
                futures::select! {
                    result = read => Event::Read(result),
                    command = commands.next() => Event::Command(command),
                    _ = stop => Event::Stop,
                }
            };

            match event {
                Event::Read(Ok(0)) => return Served::Lost(Error::SocketClosed(self.addr())),
                Event::Read(Ok(n)) => {
                    decoder.extend(&buffer[..n]);
                    while let Some(result) = decoder.next_frame() {
                        match result {
                            Ok(frame) => self.deliver(frame),
                            Err(e) => {
                                warn!(
                                    "Dropping malformed frame from {}: {}",
                                    self.descriptor.serial(),
                                    e
                                );
                                self.record_error(&e);
                            }
                        }
                    }
                }
                Event::Read(Err(e)) => return Served::Lost(Error::socket("read", e)),
                Event::Command(Some(outgoing)) => {
                    if let Err(e) = self.write(&mut stream, &outgoing).await {
                        return Served::Lost(e);
                    }
                }
                Event::Command(None) | Event::Stop => return Served::Stopped,
            }
        }
    }
}

/// Discard commands queued for a connection that is gone.
///
/// Returns `false` once every handle has been dropped.
fn drain(serial: &str, commands: &mut mpsc::UnboundedReceiver<Outgoing>) -> bool {
    loop {
        match commands.try_recv() {
            Ok(outgoing) => {
                debug!("{serial}: discarding undelivered {:?}", outgoing.command);
            }
            Err(TryRecvError::Closed) => return false,
            Err(TryRecvError::Empty) => return true,
        }
    }
}

async fn run(
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Outgoing>,
    stop: oneshot::Receiver<()>,
) {
    let mut stop = stop.fuse();
    let serial = shared.descriptor.serial().to_string();
    let addr = shared.addr();

    debug!("Starting connection task for {serial} at {addr}");

    loop {
        let outcome = {
            let attempt =
                runtime::timeout(shared.config.connect_timeout, TcpStream::connect(addr)).fuse();
            pin_mut!(attempt);
            futures::select! {
                result = attempt => Some(result),
                _ = stop => None,
            }
        };
        let Some(outcome) = outcome else { break };

        let failure = match outcome {
            Ok(Ok(stream)) => {
                if !shared.transition(SessionEvent::Connected) {
                    break;
                }
                info!("Connected to {serial} at {addr}");
                match shared.serve(stream, &mut commands, &mut stop).await {
                    Served::Stopped => break,
                    Served::Lost(e) => {
                        warn!("Connection to {serial} lost: {e}");
                        shared.record_error(&e);
                        if !shared.transition(SessionEvent::ConnectionLost) {
                            break;
                        }
                    }
                }
                None
            }
            Ok(Err(e)) => Some(Error::connect_failure(addr, e)),
            Err(_) => Some(Error::connect_failure(
                addr,
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
            )),
        };

        if let Some(e) = failure {
            debug!("{e}");
            shared.record_error(&e);
            if !shared.transition(SessionEvent::ConnectFailed) {
                break;
            }
        }

        if !drain(&serial, &mut commands) {
            break;
        }

        debug!(
            "Waiting {}s before reconnecting to {serial}",
            shared.config.backoff.as_secs_f32()
        );
        let elapsed = {
            let backoff = runtime::sleep(shared.config.backoff).fuse();
            pin_mut!(backoff);
            futures::select! {
                _ = backoff => true,
                _ = stop => false,
            }
        };
        if !elapsed || !shared.transition(SessionEvent::BackoffElapsed) {
            break;
        }
    }

    debug!("Connection task for {serial} exited");
}
