//! Pub/Sub Reader
//!
//! One thread per endpoint owns a dedicated subscriber connection, separate
//! from the command pool.
//!
//! ## Responsibilities
//! - Apply subscribe/unsubscribe requests and acknowledge them once the
//!   store confirmed, so a publish issued after `subscribe()` returns is seen
//! - Forward every received message to the shard's dispatcher queue
//! - Reconnect with backoff and resubscribe every active channel
//!
//! ## Control Flow
//! ```text
//!   caller ──Control──▶ reader thread ──Notification──▶ dispatcher queue
//!     ▲                    │  ▲
//!     └──────ack───────────┘  └── get_message() with read timeout
//! ```
//! The short poll timeout bounds how long a control request waits in the
//! queue. Subscribe and unsubscribe confirmations are read with the longer
//! control timeout, so slow links are not mistaken for dropped ones.

use std::collections::HashSet;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use r2d2::ManageConnection;
use redis::{Connection, Msg, PubSub, RedisError, RedisResult};

use crate::error::{Result, SdlError};
use crate::events::Notification;
use crate::keyspace;

use super::shard::EndpointManager;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Socket read timeouts of the reader connection
#[derive(Debug, Clone, Copy)]
pub struct ReadTimeouts {
    /// Wait for a message before checking control requests again
    pub poll: Duration,

    /// Wait for the store to confirm a subscribe or unsubscribe
    pub control: Duration,
}

enum Control {
    Subscribe(String, Sender<Result<()>>),
    Unsubscribe(String, Sender<Result<()>>),
    Shutdown,
}

enum Exit {
    Shutdown,
    Broken,
}

struct Reader {
    control: Sender<Control>,
    handle: JoinHandle<()>,
}

/// Handle to the pub/sub reader of one endpoint
///
/// The thread starts lazily on the first subscription.
pub struct Subscriber {
    label: String,
    manager: Mutex<Option<EndpointManager>>,
    events: Sender<Notification>,
    timeouts: ReadTimeouts,
    reader: Mutex<Option<Reader>>,
}

impl Subscriber {
    pub fn new(
        label: String,
        manager: EndpointManager,
        events: Sender<Notification>,
        timeouts: ReadTimeouts,
    ) -> Self {
        Self {
            label,
            manager: Mutex::new(Some(manager)),
            events,
            timeouts,
            reader: Mutex::new(None),
        }
    }

    /// Subscribe wire channels, blocking until the store confirmed each one
    pub fn subscribe(&self, channels: &[String]) -> Result<()> {
        let control = self.ensure_running()?;
        for channel in channels {
            request(&control, |ack| Control::Subscribe(channel.clone(), ack))?;
        }
        Ok(())
    }

    /// Unsubscribe wire channels; a no-op before the first subscription
    pub fn unsubscribe(&self, channels: &[String]) -> Result<()> {
        let control = match self.reader.lock().as_ref() {
            Some(reader) => reader.control.clone(),
            None => return Ok(()),
        };
        for channel in channels {
            request(&control, |ack| Control::Unsubscribe(channel.clone(), ack))?;
        }
        Ok(())
    }

    /// Stop the reader thread and drop its connection
    pub fn shutdown(&self) {
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.control.send(Control::Shutdown);
            if reader.handle.join().is_err() {
                tracing::warn!(subscriber = %self.label, "pub/sub reader panicked");
            }
            tracing::debug!(subscriber = %self.label, "pub/sub reader stopped");
        }
    }

    fn ensure_running(&self) -> Result<Sender<Control>> {
        let mut reader = self.reader.lock();
        if let Some(reader) = reader.as_ref() {
            return Ok(reader.control.clone());
        }

        let manager = self.manager.lock().take().ok_or_else(|| {
            SdlError::NotConnected(format!("pub/sub reader of {} is closed", self.label))
        })?;
        let (control_tx, control_rx) = channel::unbounded();
        let events = self.events.clone();
        let timeouts = self.timeouts;
        let label = self.label.clone();

        let handle = thread::Builder::new()
            .name(format!("sdlkv-pubsub-{}", self.label))
            .spawn(move || run(&label, manager, control_rx, events, timeouts))
            .map_err(|e| SdlError::BackendError(format!("failed to spawn pub/sub thread: {}", e)))?;

        *reader = Some(Reader {
            control: control_tx.clone(),
            handle,
        });
        Ok(control_tx)
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Reader Thread
// =============================================================================

fn request<F>(control: &Sender<Control>, make: F) -> Result<()>
where
    F: FnOnce(Sender<Result<()>>) -> Control,
{
    let (ack_tx, ack_rx) = channel::bounded(1);
    control
        .send(make(ack_tx))
        .map_err(|_| SdlError::NotConnected("pub/sub reader stopped".to_string()))?;
    ack_rx
        .recv()
        .map_err(|_| SdlError::NotConnected("pub/sub reader stopped".to_string()))?
}

fn run(
    label: &str,
    manager: EndpointManager,
    control: Receiver<Control>,
    events: Sender<Notification>,
    timeouts: ReadTimeouts,
) {
    let mut channels: HashSet<String> = HashSet::new();
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let mut conn = match manager.connect() {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(subscriber = %label, "pub/sub connect failed, retrying in {:?}: {}", backoff, e);
                if let Exit::Shutdown = wait_disconnected(&control, &mut channels, backoff) {
                    return;
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };
        backoff = INITIAL_BACKOFF;

        if !channels.is_empty() {
            tracing::info!(subscriber = %label, channels = channels.len(), "resubscribing");
        }
        match serve(label, &mut conn, &mut channels, &control, &events, timeouts) {
            Exit::Shutdown => return,
            Exit::Broken => {
                tracing::warn!(subscriber = %label, "pub/sub connection lost, reconnecting");
            }
        }
    }
}

/// Answer control requests while no connection exists
///
/// Unsubscribing only forgets the channel; subscribing fails as not
/// connected. Returns after `backoff` or after one request.
fn wait_disconnected(control: &Receiver<Control>, channels: &mut HashSet<String>, backoff: Duration) -> Exit {
    match control.recv_timeout(backoff) {
        Ok(Control::Subscribe(channel, ack)) => {
            let _ = ack.send(Err(SdlError::NotConnected(format!(
                "cannot subscribe '{}': store unreachable",
                channel
            ))));
            Exit::Broken
        }
        Ok(Control::Unsubscribe(channel, ack)) => {
            channels.remove(&channel);
            let _ = ack.send(Ok(()));
            Exit::Broken
        }
        Ok(Control::Shutdown) | Err(RecvTimeoutError::Disconnected) => Exit::Shutdown,
        Err(RecvTimeoutError::Timeout) => Exit::Broken,
    }
}

fn serve(
    label: &str,
    conn: &mut Connection,
    channels: &mut HashSet<String>,
    control: &Receiver<Control>,
    events: &Sender<Notification>,
    timeouts: ReadTimeouts,
) -> Exit {
    let mut pubsub = conn.as_pubsub();
    for channel in channels.iter() {
        if let Err(e) = confirmed(&mut pubsub, timeouts, |p| p.subscribe(channel)) {
            tracing::warn!(subscriber = %label, %channel, "resubscribe failed: {}", e);
            return Exit::Broken;
        }
    }
    if let Err(e) = pubsub.set_read_timeout(Some(timeouts.poll)) {
        tracing::warn!(subscriber = %label, "cannot set read timeout: {}", e);
        return Exit::Broken;
    }

    loop {
        // apply pending control requests before blocking on the socket
        loop {
            match control.try_recv() {
                Ok(Control::Subscribe(channel, ack)) => match confirmed(&mut pubsub, timeouts, |p| p.subscribe(&channel)) {
                    Ok(()) => {
                        tracing::debug!(subscriber = %label, %channel, "subscribed");
                        channels.insert(channel);
                        let _ = ack.send(Ok(()));
                    }
                    Err(e) => {
                        let broken = is_broken(&e);
                        let _ = ack.send(Err(e.into()));
                        if broken {
                            return Exit::Broken;
                        }
                    }
                },
                Ok(Control::Unsubscribe(channel, ack)) => {
                    channels.remove(&channel);
                    match confirmed(&mut pubsub, timeouts, |p| p.unsubscribe(&channel)) {
                        Ok(()) => {
                            tracing::debug!(subscriber = %label, %channel, "unsubscribed");
                            let _ = ack.send(Ok(()));
                        }
                        Err(e) => {
                            // forgotten either way; the next connection will not resubscribe it
                            let broken = is_broken(&e);
                            let _ = ack.send(Ok(()));
                            if broken {
                                return Exit::Broken;
                            }
                        }
                    }
                }
                Ok(Control::Shutdown) | Err(TryRecvError::Disconnected) => return Exit::Shutdown,
                Err(TryRecvError::Empty) => break,
            }
        }

        match pubsub.get_message() {
            Ok(msg) => forward(label, &msg, events),
            Err(e) if e.is_timeout() => {}
            Err(e) => {
                tracing::warn!(subscriber = %label, "pub/sub read failed: {}", e);
                return Exit::Broken;
            }
        }
    }
}

/// Run a command awaiting the store's confirmation under the control
/// timeout, then return to the poll timeout
fn confirmed<F>(pubsub: &mut PubSub<'_>, timeouts: ReadTimeouts, op: F) -> RedisResult<()>
where
    F: FnOnce(&mut PubSub<'_>) -> RedisResult<()>,
{
    pubsub.set_read_timeout(Some(timeouts.control))?;
    let outcome = op(pubsub);
    pubsub.set_read_timeout(Some(timeouts.poll))?;
    outcome
}

fn forward(label: &str, msg: &Msg, events: &Sender<Notification>) {
    let channel = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(subscriber = %label, %channel, "undecodable payload: {}", e);
            return;
        }
    };
    tracing::trace!(subscriber = %label, %channel, "message received");
    if events
        .send(Notification::new(channel, keyspace::split_events(&payload)))
        .is_err()
    {
        tracing::warn!(subscriber = %label, "event queue closed, notification dropped");
    }
}

fn is_broken(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_timeout()
}
