//! Event Dispatcher
//!
//! One registry and one inbound queue per backend connection.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SdlError};

use super::{Event, EventCallback, Notification};

/// How notifications leave the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Nothing delivered yet, either mode may still be chosen
    Idle,

    /// A dedicated thread delivers notifications
    Managed,

    /// The caller drains notifications with `poll()`
    Polling,
}

/// Routes notifications from a backend connection to registered callbacks
///
/// ## Concurrency:
/// - `registry`: RwLock, written by subscribe/unsubscribe on the caller's
///   thread, read by whichever context delivers
/// - `state`: Mutex guarding the mode and the delivery thread handle
/// - Callbacks run outside every lock, so a callback may subscribe or
///   unsubscribe channels itself
pub struct EventDispatcher {
    /// Label used for the delivery thread name and logs
    label: String,

    /// Namespaced channel → subscription
    registry: Arc<RwLock<HashMap<String, Subscription>>>,

    /// Producer side handed to the backend
    inbound_tx: Sender<Notification>,

    /// Consumer side, drained by the delivery thread or by `poll()`
    inbound_rx: Receiver<Notification>,

    /// Delivery mode and worker
    state: Mutex<DispatchState>,

    /// Serializes manual polling
    poll_lock: Mutex<()>,
}

/// Callback of one channel and the name its subscriber used
#[derive(Clone)]
struct Subscription {
    channel: String,
    callback: EventCallback,
}

struct DispatchState {
    mode: DeliveryMode,
    worker: Option<Worker>,
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl EventDispatcher {
    /// Create an idle dispatcher
    pub fn new(label: impl Into<String>) -> Self {
        let (inbound_tx, inbound_rx) = channel::unbounded();
        Self {
            label: label.into(),
            registry: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            inbound_rx,
            state: Mutex::new(DispatchState {
                mode: DeliveryMode::Idle,
                worker: None,
            }),
            poll_lock: Mutex::new(()),
        }
    }

    /// Sender the backend pushes notifications into
    pub fn sender(&self) -> Sender<Notification> {
        self.inbound_tx.clone()
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Register (or replace) the callback of a namespaced channel
    ///
    /// `channel` is the caller's name for it, handed back on delivery.
    pub fn register(&self, wire: String, channel: String, callback: EventCallback) {
        self.registry
            .write()
            .insert(wire, Subscription { channel, callback });
    }

    /// Remove a channel's callback, returning whether one was registered
    pub fn unregister(&self, channel: &str) -> bool {
        self.registry.write().remove(channel).is_some()
    }

    /// Whether a callback is registered for the namespaced channel
    pub fn is_registered(&self, channel: &str) -> bool {
        self.registry.read().contains_key(channel)
    }

    /// Number of registered channels
    pub fn subscription_count(&self) -> usize {
        self.registry.read().len()
    }

    // =========================================================================
    // Delivery
    // =========================================================================

    /// Current delivery mode
    pub fn mode(&self) -> DeliveryMode {
        self.state.lock().mode
    }

    /// Start the managed delivery thread
    ///
    /// Fails if the thread already runs or if notifications were already
    /// drained by polling.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.mode {
            DeliveryMode::Managed => {
                return Err(SdlError::RejectedByBackend(
                    "event listener already started".to_string(),
                ))
            }
            DeliveryMode::Polling => {
                return Err(SdlError::RejectedByBackend(
                    "events are already handled by polling".to_string(),
                ))
            }
            DeliveryMode::Idle => {}
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let inbound = self.inbound_rx.clone();
        let registry = Arc::clone(&self.registry);
        let label = self.label.clone();

        let handle = thread::Builder::new()
            .name(format!("sdlkv-events-{}", self.label))
            .spawn(move || delivery_loop(&label, inbound, stop_rx, registry))
            .map_err(|e| SdlError::BackendError(format!("failed to spawn event thread: {}", e)))?;

        state.mode = DeliveryMode::Managed;
        state.worker = Some(Worker {
            stop: stop_tx,
            handle,
        });

        tracing::info!(dispatcher = %self.label, "event listener started");
        Ok(())
    }

    /// Deliver at most one pending notification on the caller's thread
    ///
    /// Returns the delivered channel and events, or `None` when nothing is
    /// pending. Fails once the managed thread has been started. A call made
    /// from inside a callback of this dispatcher returns `None`.
    pub fn poll(&self) -> Result<Option<Event>> {
        {
            let mut state = self.state.lock();
            if state.mode == DeliveryMode::Managed {
                return Err(SdlError::RejectedByBackend(
                    "event listener already started".to_string(),
                ));
            }
            state.mode = DeliveryMode::Polling;
        }

        let Some(_guard) = self.poll_lock.try_lock() else {
            return Ok(None);
        };

        loop {
            match self.inbound_rx.try_recv() {
                Ok(notification) => {
                    if let Some(event) = deliver(&self.label, &self.registry, notification) {
                        return Ok(Some(event));
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(None),
            }
        }
    }

    /// Stop the delivery thread, if any
    pub fn shutdown(&self) {
        let worker = self.state.lock().worker.take();
        if let Some(worker) = worker {
            let _ = worker.stop.send(());
            // a callback closing its own storage must not join itself
            if worker.handle.thread().id() != thread::current().id() {
                if worker.handle.join().is_err() {
                    tracing::warn!(dispatcher = %self.label, "event thread panicked");
                }
            }
            tracing::debug!(dispatcher = %self.label, "event listener stopped");
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn delivery_loop(
    label: &str,
    inbound: Receiver<Notification>,
    stop: Receiver<()>,
    registry: Arc<RwLock<HashMap<String, Subscription>>>,
) {
    loop {
        crossbeam::select! {
            recv(inbound) -> msg => match msg {
                Ok(notification) => {
                    deliver(label, &registry, notification);
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
}

/// Invoke the callback of a notification's channel
///
/// Returns the event under the subscriber's channel name, or `None` when the
/// channel is no longer subscribed. A panicking callback is logged and does
/// not stop delivery.
fn deliver(
    label: &str,
    registry: &RwLock<HashMap<String, Subscription>>,
    notification: Notification,
) -> Option<Event> {
    let Some(Subscription { channel, callback }) = registry.read().get(&notification.channel).cloned()
    else {
        tracing::debug!(dispatcher = %label, wire = %notification.channel, "dropping notification for unsubscribed channel");
        return None;
    };

    let events = &notification.events;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&channel, events)));
    if outcome.is_err() {
        tracing::error!(dispatcher = %label, %channel, "event callback panicked");
    }

    Some((channel, notification.events))
}
