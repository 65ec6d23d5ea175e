//! Storage Module
//!
//! The synchronous facade every caller goes through.
//!
//! ## Responsibilities
//! - Validate arguments before anything reaches a backend
//! - Normalize collection-shaped arguments (any iterable of keys, channels or
//!   members; duplicates collapse; empty inputs short-circuit)
//! - Sort outputs that have a deterministic order
//! - Delegate to the backend chosen at construction
//!
//! ## Example
//! ```
//! use std::collections::HashMap;
//! use sdlkv::SyncStorage;
//!
//! let sdl = SyncStorage::in_memory();
//! let mut data = HashMap::new();
//! data.insert("my_key".to_string(), b"my_value".to_vec());
//! sdl.set("ns", &data).unwrap();
//!
//! assert_eq!(sdl.find_keys("ns", "my_k*").unwrap(), vec!["my_key"]);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{self, DbBackend, MemoryBackend};
use crate::config::Config;
use crate::error::{Result, SdlError};
use crate::events::Event;
use crate::keyspace::{self, ChannelsAndEvents};
use crate::lock::SyncLock;

/// Shared data layer storage
///
/// ## Concurrency
/// All calls are blocking round trips and may be issued from any number of
/// threads at once. Notifications are delivered on a separate thread once
/// `start_event_listener()` was called, or on the caller's thread by
/// `handle_events()`.
pub struct SyncStorage {
    backend: Arc<dyn DbBackend>,
    closed: Arc<AtomicBool>,
}

impl SyncStorage {
    /// Open storage on the backend selected by `config`
    pub fn new(config: &Config) -> Result<Self> {
        tracing::info!(%config, "opening storage");
        Ok(Self::with_backend(backend::open(config)?))
    }

    /// Open storage configured from the process environment
    pub fn from_env() -> Result<Self> {
        Self::new(&Config::from_env()?)
    }

    /// Storage over a fresh in-memory backend
    pub fn in_memory() -> Self {
        Self::with_backend(Arc::new(MemoryBackend::new()))
    }

    /// Storage over an already constructed backend
    pub fn with_backend(backend: Arc<dyn DbBackend>) -> Self {
        Self {
            backend,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Whether every backend endpoint answers; any failure counts as inactive
    pub fn is_active(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.backend.is_connected() {
            Ok(connected) => connected,
            Err(e) => {
                tracing::debug!("storage inactive: {}", e);
                false
            }
        }
    }

    /// Stop notification delivery and release connections
    ///
    /// Idempotent. Every later operation fails with `NotConnected`.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.backend.close();
        tracing::info!("storage closed");
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    /// Write every pair of `data`
    pub fn set(&self, ns: &str, data: &HashMap<String, Vec<u8>>) -> Result<()> {
        self.ensure_open()?;
        if data.is_empty() {
            return Ok(());
        }
        self.backend.set(ns, data)
    }

    /// Replace the value of `key` with `new_data` only if it currently equals
    /// `old_data`
    pub fn set_if(&self, ns: &str, key: &str, old_data: &[u8], new_data: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.backend.set_if(ns, key, old_data, new_data)
    }

    /// Write `key` only if it does not exist yet
    pub fn set_if_not_exists(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.backend.set_if_not_exists(ns, key, data)
    }

    /// Values of the keys found, ordered by key; absent keys are omitted
    pub fn get<I, K>(&self, ns: &str, keys: I) -> Result<BTreeMap<String, Vec<u8>>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.ensure_open()?;
        let keys = normalize(keys);
        if keys.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(self.backend.get(ns, &keys)?.into_iter().collect())
    }

    /// Keys matching a glob pattern, sorted
    ///
    /// Not atomic and not isolated: keys written or removed concurrently may
    /// or may not be reported.
    pub fn find_keys(&self, ns: &str, pattern: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut keys = self.backend.find_keys(ns, pattern)?;
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Keys matching a glob pattern with their values, ordered by key
    ///
    /// Same isolation caveat as `find_keys`.
    pub fn find_and_get(&self, ns: &str, pattern: &str) -> Result<BTreeMap<String, Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.backend.find_and_get(ns, pattern)?.into_iter().collect())
    }

    /// Remove keys; absent keys are ignored
    pub fn remove<I, K>(&self, ns: &str, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.ensure_open()?;
        let keys = normalize(keys);
        if keys.is_empty() {
            return Ok(());
        }
        self.backend.remove(ns, &keys)
    }

    /// Remove `key` only if it currently stores `data`
    pub fn remove_if(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.backend.remove_if(ns, key, data)
    }

    /// Remove every key of the namespace
    ///
    /// Scans, then deletes; keys written during the call may survive.
    pub fn remove_all(&self, ns: &str) -> Result<()> {
        self.ensure_open()?;
        let keys = self.backend.find_keys(ns, "*")?;
        if keys.is_empty() {
            return Ok(());
        }
        tracing::debug!(ns, keys = keys.len(), "remove_all");
        self.backend.remove(ns, &keys)
    }

    // =========================================================================
    // Group Operations
    // =========================================================================

    /// Add members to a group, creating it on first use
    pub fn add_member<I, M>(&self, ns: &str, group: &str, members: I) -> Result<()>
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        self.ensure_open()?;
        let members = member_set(members);
        if members.is_empty() {
            return Ok(());
        }
        self.backend.add_member(ns, group, &members)
    }

    /// Remove members; unknown members and groups are ignored
    pub fn remove_member<I, M>(&self, ns: &str, group: &str, members: I) -> Result<()>
    where
        I: IntoIterator<Item = M>,
        M: Into<Vec<u8>>,
    {
        self.ensure_open()?;
        let members = member_set(members);
        if members.is_empty() {
            return Ok(());
        }
        self.backend.remove_member(ns, group, &members)
    }

    pub fn remove_group(&self, ns: &str, group: &str) -> Result<()> {
        self.ensure_open()?;
        self.backend.remove_group(ns, group)
    }

    /// Members of a group; an absent group is empty
    pub fn get_members(&self, ns: &str, group: &str) -> Result<HashSet<Vec<u8>>> {
        self.ensure_open()?;
        self.backend.get_members(ns, group)
    }

    pub fn is_member(&self, ns: &str, group: &str, member: &[u8]) -> Result<bool> {
        self.ensure_open()?;
        self.backend.is_member(ns, group, member)
    }

    /// Number of members; 0 for an absent group
    pub fn group_size(&self, ns: &str, group: &str) -> Result<usize> {
        self.ensure_open()?;
        self.backend.group_size(ns, group)
    }

    // =========================================================================
    // Write + Publish
    // =========================================================================
    // Each combinator publishes its events if and only if the mutation took
    // effect, in the same indivisible step.

    pub fn set_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        data: &HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        self.ensure_open()?;
        keyspace::validate_events(channels_and_events)?;
        self.backend.set_and_publish(ns, channels_and_events, data)
    }

    pub fn set_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        old_data: &[u8],
        new_data: &[u8],
    ) -> Result<bool> {
        self.ensure_open()?;
        keyspace::validate_events(channels_and_events)?;
        self.backend
            .set_if_and_publish(ns, channels_and_events, key, old_data, new_data)
    }

    pub fn set_if_not_exists_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        self.ensure_open()?;
        keyspace::validate_events(channels_and_events)?;
        self.backend
            .set_if_not_exists_and_publish(ns, channels_and_events, key, data)
    }

    pub fn remove_and_publish<I, K>(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        keys: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.ensure_open()?;
        keyspace::validate_events(channels_and_events)?;
        let keys = normalize(keys);
        self.backend.remove_and_publish(ns, channels_and_events, &keys)
    }

    pub fn remove_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        self.ensure_open()?;
        keyspace::validate_events(channels_and_events)?;
        self.backend
            .remove_if_and_publish(ns, channels_and_events, key, data)
    }

    /// Remove every key of the namespace, then publish
    ///
    /// Best effort like `remove_all`.
    pub fn remove_all_and_publish(&self, ns: &str, channels_and_events: &ChannelsAndEvents) -> Result<()> {
        self.ensure_open()?;
        keyspace::validate_events(channels_and_events)?;
        self.backend.remove_all_and_publish(ns, channels_and_events)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    /// Register `callback` for channels of a namespace
    ///
    /// The callback receives the channel name without namespace and the
    /// events published together. Subscribing a channel again replaces its
    /// callback.
    pub fn subscribe_channel<F, I, C>(&self, ns: &str, callback: F, channels: I) -> Result<()>
    where
        F: Fn(&str, &[String]) + Send + Sync + 'static,
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.ensure_open()?;
        let channels = normalize(channels);
        if channels.is_empty() {
            return Ok(());
        }
        self.backend.subscribe_channel(ns, Arc::new(callback), &channels)
    }

    pub fn unsubscribe_channel<I, C>(&self, ns: &str, channels: I) -> Result<()>
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.ensure_open()?;
        let channels = normalize(channels);
        if channels.is_empty() {
            return Ok(());
        }
        self.backend.unsubscribe_channel(ns, &channels)
    }

    /// Deliver notifications on a dedicated thread from now on
    ///
    /// Fails without subscriptions, when already started, or after
    /// `handle_events()` was used.
    pub fn start_event_listener(&self) -> Result<()> {
        self.ensure_open()?;
        self.backend.start_event_listener()
    }

    /// Deliver at most one pending notification on the caller's thread
    ///
    /// Invokes the channel's callback and returns the channel and events.
    /// Fails once `start_event_listener()` was called.
    pub fn handle_events(&self) -> Result<Option<Event>> {
        self.ensure_open()?;
        self.backend.handle_events()
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Handle to the lock `name` of a namespace; does not acquire it
    pub fn get_lock_resource(&self, ns: &str, name: &str, expiration: Duration) -> Result<SyncLock> {
        self.ensure_open()?;
        SyncLock::new(
            Arc::clone(&self.backend),
            Arc::clone(&self.closed),
            ns,
            name,
            expiration,
        )
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdlError::NotConnected("storage is closed".to_string()));
        }
        Ok(())
    }
}

impl fmt::Display for SyncStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.closed.load(Ordering::Acquire) {
            "closed"
        } else {
            "open"
        };
        write!(f, "SyncStorage({}, {})", self.backend.describe(), state)
    }
}

impl Drop for SyncStorage {
    fn drop(&mut self) {
        self.close();
    }
}

/// Collapse any iterable of names into a sorted, duplicate-free list
fn normalize<I, K>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = K>,
    K: Into<String>,
{
    items
        .into_iter()
        .map(Into::into)
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect()
}

fn member_set<I, M>(members: I) -> HashSet<Vec<u8>>
where
    I: IntoIterator<Item = M>,
    M: Into<Vec<u8>>,
{
    members.into_iter().map(Into::into).collect()
}
