//! Device discovery via UDP broadcast.
//!
//! Devices answer an INFO request sent to UDP port 6095 with the same reply
//! they give on the control channel. The listener broadcasts that request,
//! then keeps reading the socket so devices that announce themselves later
//! are picked up too.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::{mpsc, oneshot};
use futures::future::FutureExt;
use futures::{Stream, StreamExt, pin_mut};
use log::{debug, error, info, warn};

use crate::codec::{self, CommandType, DataPointMap, FrameDecoder, TERMINATOR};
use crate::config::DiscoveryConfig;
use crate::device::DeviceDescriptor;
use crate::errors::Error;
use crate::runtime::{self, AsyncUdpSocket, Instant, JoinHandle, UdpSocket};

type Result<T> = std::result::Result<T, Error>;

/// How devices become known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    /// The device list is configured up front; the listener does nothing.
    Static,
    /// Probe and listen on UDP.
    Broadcast(DiscoveryConfig),
}

/// Output of a running listener.
#[derive(Debug)]
pub enum DiscoveryEvent {
    /// A device answered or announced itself. The same device may be
    /// reported many times.
    Found(DeviceDescriptor),
    /// The listener could not run. Sent once, after which the stream ends.
    Failed(Error),
}

/// Lifecycle of a [`DiscoveryListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Running,
    /// The last run hit a socket error and ended. Not retried automatically.
    Failed,
    Stopped,
}

/// Events from one run of the listener.
#[derive(Debug)]
pub struct DiscoveryStream {
    receiver: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl Stream for DiscoveryStream {
    type Item = DiscoveryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DiscoveryEvent>> {
        self.receiver.poll_next_unpin(cx)
    }
}

struct Run {
    stop: oneshot::Sender<()>,
    _task: JoinHandle<()>,
}

/// Restartable discovery listener.
///
/// # Examples
///
/// ```
/// use cozylife_local::{DiscoveryListener, DiscoveryMode, ListenerState};
///
/// let listener = DiscoveryListener::new(DiscoveryMode::Static);
/// assert_eq!(listener.state(), ListenerState::Idle);
/// ```
pub struct DiscoveryListener {
    mode: DiscoveryMode,
    status: Arc<Mutex<Status>>,
    run: Mutex<Option<Run>>,
}

/// State of the most recent run. A finished run only updates it while it is
/// still the current one.
struct Status {
    run: u64,
    state: ListenerState,
}

impl Status {
    fn finish(&mut self, run: u64, state: ListenerState) {
        if self.run == run && self.state == ListenerState::Running {
            self.state = state;
        }
    }
}

impl DiscoveryListener {
    pub fn new(mode: DiscoveryMode) -> Self {
        DiscoveryListener {
            mode,
            status: Arc::new(Mutex::new(Status {
                run: 0,
                state: ListenerState::Idle,
            })),
            run: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> &DiscoveryMode {
        &self.mode
    }

    pub fn state(&self) -> ListenerState {
        lock(&self.status).state
    }

    /// Launch a run and return its events.
    ///
    /// Any previous run is stopped first. In static mode the stream ends
    /// immediately. Must be called from within the async runtime.
    pub fn start(&self) -> DiscoveryStream {
        self.stop();

        let (events, receiver) = mpsc::unbounded();
        let DiscoveryMode::Broadcast(config) = &self.mode else {
            return DiscoveryStream { receiver };
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let run = {
            let mut status = lock(&self.status);
            status.run += 1;
            status.state = ListenerState::Running;
            status.run
        };
        let task = runtime::spawn(listen(
            config.clone(),
            events,
            Arc::clone(&self.status),
            run,
            stop_rx,
        ));
        *lock(&self.run) = Some(Run {
            stop: stop_tx,
            _task: task,
        });

        DiscoveryStream { receiver }
    }

    /// Stop the current run, if any. The stream of that run ends.
    pub fn stop(&self) {
        let Some(run) = lock(&self.run).take() else {
            return;
        };
        let _ = run.stop.send(());
        let mut status = lock(&self.status);
        let current = status.run;
        status.finish(current, ListenerState::Stopped);
    }
}

impl Drop for DiscoveryListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

enum Event {
    Received(std::io::Result<(usize, SocketAddr)>),
    Reprobe,
    Stop,
}

async fn open(config: &DiscoveryConfig) -> Result<UdpSocket> {
    let socket = UdpSocket::bind(&config.bind_addr.to_string())
        .await
        .map_err(|e| Error::DiscoveryFailed(format!("bind {}: {e}", config.bind_addr)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::DiscoveryFailed(format!("enable broadcast: {e}")))?;
    Ok(socket)
}

async fn probe(socket: &UdpSocket, config: &DiscoveryConfig) -> Result<()> {
    let request = codec::encode(CommandType::Info, &DataPointMap::new())?;
    socket
        .send_to(&request, &config.probe_addr.to_string())
        .await
        .map_err(|e| Error::DiscoveryFailed(format!("probe {}: {e}", config.probe_addr)))?;
    debug!("Sent discovery probe to {}", config.probe_addr);
    Ok(())
}

async fn listen(
    config: DiscoveryConfig,
    events: mpsc::UnboundedSender<DiscoveryEvent>,
    status: Arc<Mutex<Status>>,
    run: u64,
    stop: oneshot::Receiver<()>,
) {
    let setup = async {
        let socket = open(&config).await?;
        probe(&socket, &config).await?;
        Ok::<_, Error>(socket)
    };
    let socket = match setup.await {
        Ok(socket) => socket,
        Err(e) => {
            error!("Discovery failed: {e}");
            lock(&status).finish(run, ListenerState::Failed);
            let _ = events.unbounded_send(DiscoveryEvent::Failed(e));
            return;
        }
    };

    info!("Listening for devices on {}", config.bind_addr);

    let mut stop = stop.fuse();
    let mut buffer = [0u8; 4096];
    let mut last_probe = Instant::now();

    loop {
        let event = {
            let received = socket.recv_from(&mut buffer).fuse();
            let reprobe = async {
                match config.reprobe_interval {
                    Some(interval) => {
                        runtime::sleep(interval.saturating_sub(last_probe.elapsed())).await
                    }
                    None => futures::future::pending::<()>().await,
                }
            }
            .fuse();
            pin_mut!(received, reprobe);
            futures::select! {
                result = received => Event::Received(result),
                _ = reprobe => Event::Reprobe,
                _ = stop => Event::Stop,
            }
        };

        match event {
            Event::Received(Ok((size, source))) => {
                let Some(descriptor) = parse_announcement(&buffer[..size], source) else {
                    continue;
                };
                debug!(
                    "Discovered {} ({:?}) at {}",
                    descriptor.serial(),
                    descriptor.device_type(),
                    descriptor.ip()
                );
                if events
                    .unbounded_send(DiscoveryEvent::Found(descriptor))
                    .is_err()
                {
                    break;
                }
            }
            Event::Received(Err(e)) => warn!("Discovery receive error: {e}"),
            Event::Reprobe => {
                last_probe = Instant::now();
                if let Err(e) = probe(&socket, &config).await {
                    warn!("{e}");
                }
            }
            Event::Stop => break,
        }
    }

    lock(&status).finish(run, ListenerState::Stopped);
    debug!("Discovery listener on {} stopped", config.bind_addr);
}

/// Turn an INFO reply datagram into a descriptor.
///
/// Anything else on the port, including our own probe, yields `None`.
pub(crate) fn parse_announcement(datagram: &[u8], source: SocketAddr) -> Option<DeviceDescriptor> {
    let SocketAddr::V4(source) = source else {
        return None;
    };

    let mut decoder = FrameDecoder::new();
    decoder.extend(datagram);
    if !datagram.ends_with(TERMINATOR) {
        decoder.extend(TERMINATOR);
    }

    let frame = match decoder.next_frame()? {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Ignoring datagram from {source}: {e}");
            return None;
        }
    };
    let info = frame.info?;
    Some(DeviceDescriptor::from_info(&info, *source.ip()))
}

/// Probe for devices and collect answers for `discovery_timeout`.
///
/// Results are deduplicated by serial number.
///
/// # Examples
///
/// ```ignore
/// use std::time::Duration;
/// use cozylife_local::{DiscoveryConfig, discover_devices};
///
/// let devices = discover_devices(&DiscoveryConfig::default(), Duration::from_secs(3)).await?;
/// for device in devices {
///     println!("{} {}", device.serial(), device.ip());
/// }
/// ```
pub async fn discover_devices(
    config: &DiscoveryConfig,
    discovery_timeout: Duration,
) -> Result<Vec<DeviceDescriptor>> {
    let listener = DiscoveryListener::new(DiscoveryMode::Broadcast(config.clone()));
    let mut events = listener.start();
    let mut discovered: HashMap<String, DeviceDescriptor> = HashMap::new();
    let start = Instant::now();

    while let Some(remaining) = discovery_timeout.checked_sub(start.elapsed()) {
        match runtime::timeout(remaining, events.next()).await {
            Ok(Some(DiscoveryEvent::Found(descriptor))) => {
                discovered.insert(descriptor.serial().to_string(), descriptor);
            }
            Ok(Some(DiscoveryEvent::Failed(e))) => return Err(e),
            Ok(None) | Err(_) => break,
        }
    }

    listener.stop();
    Ok(discovered.into_values().collect())
}
