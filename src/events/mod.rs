//! Event Dispatch Module
//!
//! Subscription registry and delivery of channel notifications.
//!
//! ## Responsibilities
//! - Map namespaced channels to caller callbacks
//! - Carry notifications from a backend to callbacks over a channel
//! - Run exactly one of two delivery modes per dispatcher
//!
//! ## Delivery Modes
//! ```text
//!   backend ──Notification──▶ inbound queue ──┬──▶ delivery thread (managed)
//!                                             └──▶ poll()          (manual)
//! ```
//! A managed dispatcher owns a dedicated thread that waits on the queue and
//! invokes callbacks one at a time. A polled dispatcher is drained by the
//! caller, one notification per `poll()`. Once a mode has been used the other
//! one is refused.

mod dispatcher;

use std::sync::Arc;

pub use dispatcher::{DeliveryMode, EventDispatcher};

/// Callback invoked with the channel name (namespace stripped) and its events
pub type EventCallback = Arc<dyn Fn(&str, &[String]) + Send + Sync>;

/// A channel name and the events delivered with it
pub type Event = (String, Vec<String>);

/// A notification as produced by a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Namespaced channel, as encoded on the wire
    pub channel: String,

    /// Events in publish order
    pub events: Vec<String>,
}

impl Notification {
    pub fn new(channel: impl Into<String>, events: Vec<String>) -> Self {
        Self {
            channel: channel.into(),
            events,
        }
    }
}
