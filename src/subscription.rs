//! Fan-out of decoded frames to subscribers.

use std::cell::Cell;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Frame;

/// Callback receiving the device serial and a decoded frame.
pub type FrameCallback = Arc<dyn Fn(&str, &Frame) + Send + Sync + 'static>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Stream of frames from one device session.
///
/// Ends when the session is stopped or the subscription is removed.
#[derive(Debug)]
pub struct FrameStream {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<Frame>,
}

impl FrameStream {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Stream for FrameStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.receiver.poll_next_unpin(cx)
    }
}

#[derive(Clone)]
enum Sink {
    Callback(FrameCallback),
    Channel(mpsc::UnboundedSender<Frame>),
}

thread_local! {
    // Depth of `Subscribers::dispatch` calls on this thread.
    static DISPATCH_DEPTH: Cell<usize> = const { Cell::new(0) };
}

struct DispatchScope;

impl DispatchScope {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DispatchScope
    }

    fn active() -> bool {
        DISPATCH_DEPTH.with(|depth| depth.get() > 0)
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// Subscriber registry shared by a session (or the pool) and its callers.
///
/// Callbacks run without the registry locked, so they may subscribe,
/// unsubscribe or close the registry that is calling them. Once [`close`]
/// returns no callback runs again, except when `close` is itself called
/// from a callback: it then returns at once and only later calls are
/// suppressed.
///
/// [`close`]: Subscribers::close
#[derive(Default)]
pub(crate) struct Subscribers {
    closed: AtomicBool,
    sinks: Mutex<Vec<(SubscriptionId, Sink)>>,
    // Held for the whole of a dispatch so `close` can wait it out.
    delivery: Mutex<()>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &Frame) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        self.register(id, Sink::Callback(Arc::new(callback)));
        id
    }

    pub fn stream(&self) -> FrameStream {
        let id = SubscriptionId::new();
        let (sender, receiver) = mpsc::unbounded();
        self.register(id, Sink::Channel(sender));
        FrameStream { id, receiver }
    }

    fn register(&self, id: SubscriptionId, sink: Sink) {
        let mut sinks = lock(&self.sinks);
        // Checked under the lock so a concurrent close cannot miss the sink.
        if !self.is_closed() {
            sinks.push((id, sink));
        }
    }

    /// Returns `false` when the id was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let removed = {
            let mut sinks = lock(&self.sinks);
            sinks
                .iter()
                .position(|(sid, _)| *sid == id)
                .map(|index| sinks.remove(index))
        };
        removed.is_some()
    }

    /// Deliver a frame to every subscriber. Returns `false` once closed.
    pub fn dispatch(&self, serial: &str, frame: &Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        let _delivery = lock(&self.delivery);
        let _scope = DispatchScope::enter();

        let sinks: Vec<(SubscriptionId, Sink)> = lock(&self.sinks).clone();
        let mut dead = Vec::new();
        for (id, sink) in sinks {
            if self.is_closed() {
                return false;
            }
            match sink {
                Sink::Callback(callback) => callback(serial, frame),
                Sink::Channel(sender) => {
                    if sender.unbounded_send(frame.clone()).is_err() {
                        debug!("Dropping closed frame stream {id}");
                        dead.push(id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            lock(&self.sinks).retain(|(id, _)| !dead.contains(id));
        }
        true
    }

    /// Drop every subscriber and refuse new ones. Open streams end.
    ///
    /// Waits for a dispatch running on another thread to finish, unless
    /// called from inside a callback.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let sinks = std::mem::take(&mut *lock(&self.sinks));
        if !DispatchScope::active() {
            drop(lock(&self.delivery));
        }
        drop(sinks);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        lock(&self.sinks).len()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl fmt::Debug for Subscribers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("closed", &self.is_closed())
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CommandType, DataPointMap};
    use std::sync::atomic::AtomicUsize;

    fn push(value: u32) -> Frame {
        Frame {
            command: CommandType::Push,
            sn: String::new(),
            attrs: vec![1],
            data: DataPointMap::new().with(1, value),
            info: None,
            result: None,
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let subscribers = Subscribers::new();
        let id = subscribers.subscribe(|_, _| {});
        assert_eq!(subscribers.len(), 1);
        assert!(subscribers.unsubscribe(id));
        assert!(!subscribers.unsubscribe(id));
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn test_dispatch_reaches_callbacks_in_order() {
        let subscribers = Subscribers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        subscribers.subscribe(move |serial, frame| {
            sink.lock()
                .unwrap()
                .push((serial.to_string(), frame.data.get_u32(1)));
        });

        subscribers.dispatch("abc", &push(1));
        subscribers.dispatch("abc", &push(2));

        assert_eq!(
            *seen.lock().unwrap(),
            vec![("abc".to_string(), Some(1)), ("abc".to_string(), Some(2))]
        );
    }

    #[test]
    fn test_close_stops_delivery() {
        let subscribers = Subscribers::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        subscribers.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(subscribers.dispatch("abc", &push(1)));
        subscribers.close();
        assert!(!subscribers.dispatch("abc", &push(2)));
        subscribers.subscribe(|_, _| {});

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(subscribers.len(), 0);
        assert!(subscribers.is_closed());
    }

    #[test]
    fn test_callback_may_close_its_registry() {
        let subscribers = Arc::new(Subscribers::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let registry = Arc::clone(&subscribers);
        let counter = Arc::clone(&calls);
        subscribers.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            registry.close();
        });
        let counter = Arc::clone(&calls);
        subscribers.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!subscribers.dispatch("abc", &push(1)));
        assert!(!subscribers.dispatch("abc", &push(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(subscribers.is_closed());
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn test_callback_may_unsubscribe_itself() {
        let subscribers = Arc::new(Subscribers::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let own_id = Arc::new(Mutex::new(None));

        let registry = Arc::clone(&subscribers);
        let counter = Arc::clone(&calls);
        let slot = Arc::clone(&own_id);
        let id = subscribers.subscribe(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = slot.lock().unwrap().take() {
                assert!(registry.unsubscribe(id));
            }
        });
        *own_id.lock().unwrap() = Some(id);

        assert!(subscribers.dispatch("abc", &push(1)));
        assert!(subscribers.dispatch("abc", &push(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(subscribers.len(), 0);
    }

    #[test]
    fn test_close_waits_for_running_callback() {
        let subscribers = Arc::new(Subscribers::new());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let done = Arc::clone(&finished);
        subscribers.subscribe(move |_, _| {
            entered_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(100));
            done.store(true, Ordering::SeqCst);
        });

        let registry = Arc::clone(&subscribers);
        let worker = std::thread::spawn(move || registry.dispatch("abc", &push(1)));
        entered_rx.recv().unwrap();
        subscribers.close();

        assert!(finished.load(Ordering::SeqCst));
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_stream_receives_and_ends_on_close() {
        let subscribers = Subscribers::new();
        let mut stream = subscribers.stream();
        subscribers.dispatch("abc", &push(7));
        subscribers.close();

        let frames: Vec<Frame> = futures::executor::block_on(async {
            let mut out = Vec::new();
            while let Some(frame) = stream.next().await {
                out.push(frame);
            }
            out
        });
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.get_u32(1), Some(7));
    }

    #[test]
    fn test_dropped_stream_is_pruned() {
        let subscribers = Subscribers::new();
        drop(subscribers.stream());
        assert_eq!(subscribers.len(), 1);
        subscribers.dispatch("abc", &push(1));
        assert_eq!(subscribers.len(), 0);
    }
}
