//! Backend Module
//!
//! The capability set every store variant implements, and the construction
//! of the variant selected by [`Config::backend`].
//!
//! ## Contract
//! - Point operations, with compare-and-swap and compare-and-delete evaluated
//!   as one indivisible step
//! - Group (set) operations
//! - Write+publish combinators: the notification is queued if and only if the
//!   guarded mutation took effect
//! - Subscription management and the two event delivery modes
//! - Lock primitives keyed by the lock's wire key
//!
//! Arguments reaching a backend are already validated and normalized by the
//! storage facade: collections are non-empty and events carry no separator.

pub mod memory;
pub mod remote;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{BackendType, Config};
use crate::error::Result;
use crate::events::{Event, EventCallback};
use crate::keyspace::ChannelsAndEvents;

pub use self::memory::MemoryBackend;
pub use self::remote::RedisBackend;

/// A store implementation behind the storage facade
pub trait DbBackend: Send + Sync {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Whether every underlying connection answers
    fn is_connected(&self) -> Result<bool>;

    /// Stop background threads and drop connections
    fn close(&self);

    /// Short description used by `Display` of the facade
    fn describe(&self) -> String;

    // =========================================================================
    // Point Operations
    // =========================================================================

    fn set(&self, ns: &str, data: &HashMap<String, Vec<u8>>) -> Result<()>;

    fn set_if(&self, ns: &str, key: &str, old_data: &[u8], new_data: &[u8]) -> Result<bool>;

    fn set_if_not_exists(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool>;

    /// Values of the keys found; absent keys are omitted
    fn get(&self, ns: &str, keys: &[String]) -> Result<HashMap<String, Vec<u8>>>;

    /// Not atomic, not isolated against concurrent writers
    fn find_keys(&self, ns: &str, pattern: &str) -> Result<Vec<String>>;

    /// Not atomic, not isolated against concurrent writers
    fn find_and_get(&self, ns: &str, pattern: &str) -> Result<HashMap<String, Vec<u8>>>;

    fn remove(&self, ns: &str, keys: &[String]) -> Result<()>;

    fn remove_if(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool>;

    // =========================================================================
    // Group Operations
    // =========================================================================

    fn add_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()>;

    fn remove_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()>;

    fn remove_group(&self, ns: &str, group: &str) -> Result<()>;

    fn get_members(&self, ns: &str, group: &str) -> Result<HashSet<Vec<u8>>>;

    fn is_member(&self, ns: &str, group: &str, member: &[u8]) -> Result<bool>;

    fn group_size(&self, ns: &str, group: &str) -> Result<usize>;

    // =========================================================================
    // Write + Publish
    // =========================================================================

    fn set_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        data: &HashMap<String, Vec<u8>>,
    ) -> Result<()>;

    fn set_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        old_data: &[u8],
        new_data: &[u8],
    ) -> Result<bool>;

    fn set_if_not_exists_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool>;

    fn remove_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        keys: &[String],
    ) -> Result<()>;

    fn remove_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool>;

    /// Scans, then deletes and publishes; best effort like every scan
    fn remove_all_and_publish(&self, ns: &str, channels_and_events: &ChannelsAndEvents) -> Result<()>;

    // =========================================================================
    // Notifications
    // =========================================================================

    fn subscribe_channel(&self, ns: &str, callback: EventCallback, channels: &[String]) -> Result<()>;

    fn unsubscribe_channel(&self, ns: &str, channels: &[String]) -> Result<()>;

    /// Start managed delivery; fails without subscriptions or when already chosen
    fn start_event_listener(&self) -> Result<()>;

    /// Deliver one pending notification, if any; fails under managed delivery
    fn handle_events(&self) -> Result<Option<Event>>;

    // =========================================================================
    // Lock Primitives
    // =========================================================================

    /// Store `token` under the lock key if absent, expiring after `expiration`
    fn lock_acquire(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool>;

    /// Delete the lock key if it still holds `token`
    fn lock_release(&self, ns: &str, name: &str, token: &str) -> Result<bool>;

    /// Reset the expiration if the lock key still holds `token`
    fn lock_refresh(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool>;

    /// In one atomic step, check that the lock key holds `token` and read its
    /// remaining time to live; a mismatch is a rejection
    fn lock_validity(&self, ns: &str, name: &str, token: &str) -> Result<Duration>;

    /// Current holder token of the lock, if any
    fn lock_holder(&self, ns: &str, name: &str) -> Result<Option<String>>;
}

/// Construct the backend selected by the configuration
pub fn open(config: &Config) -> Result<Arc<dyn DbBackend>> {
    match config.backend {
        BackendType::InMemory => Ok(Arc::new(MemoryBackend::new())),
        BackendType::Remote => Ok(Arc::new(RedisBackend::connect(config)?)),
    }
}
