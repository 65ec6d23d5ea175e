//! In-Memory Backend
//!
//! Process-local implementation of the backend contract, for tests and
//! offline development. Not coherent across processes.
//!
//! ## Concurrency
//! One `parking_lot::Mutex` guards the whole key space. Every operation,
//! including compare-and-swap, compare-and-delete and the write+publish
//! combinators, runs start to finish under that lock, so each is a single
//! indivisible step exactly like a server-evaluated command. Notifications
//! are queued before the lock is released, which keeps them in mutation
//! order.
//!
//! ## Parity with the networked store
//! - Namespaces are isolated through the same wire keys
//! - Groups and values share the key space; addressing a key with the
//!   wrong kind of operation is rejected
//! - Lock keys expire
//! - Notifications for channels nobody subscribes to are dropped

mod store;

pub use store::{Data, Store};

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crossbeam::channel::Sender;
use parking_lot::Mutex;

use crate::error::{Result, SdlError};
use crate::events::{Event, EventCallback, EventDispatcher, Notification};
use crate::keyspace::{self, ChannelsAndEvents};

use super::DbBackend;

/// In-memory backend
pub struct MemoryBackend {
    /// Key space shared by values, groups and locks
    store: Mutex<Store>,

    /// Subscription registry and delivery
    dispatcher: EventDispatcher,

    /// Producer side of the dispatcher queue
    notify_tx: Sender<Notification>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        let dispatcher = EventDispatcher::new("memory");
        let notify_tx = dispatcher.sender();
        Self {
            store: Mutex::new(Store::new()),
            dispatcher,
            notify_tx,
        }
    }

    /// Number of live keys across all namespaces
    pub fn key_count(&self) -> usize {
        self.store.lock().len()
    }

    /// Queue notifications for subscribed channels
    ///
    /// Called with the store lock held.
    fn publish(&self, ns: &str, channels_and_events: &ChannelsAndEvents) {
        for (channel, payload) in keyspace::prepare_channels(ns, channels_and_events) {
            if !self.dispatcher.is_registered(&channel) {
                tracing::trace!(%channel, "no subscriber, notification dropped");
                continue;
            }
            let notification = Notification::new(channel, keyspace::split_events(&payload));
            if self.notify_tx.send(notification).is_err() {
                tracing::warn!("event queue closed, notification dropped");
            }
        }
    }

    fn set_if_locked(store: &mut Store, wire_key: &str, old_data: &[u8], new_data: &[u8]) -> Result<bool> {
        if !Self::holds(store, wire_key, old_data)? {
            return Ok(false);
        }
        store.put_value(wire_key, new_data.to_vec());
        Ok(true)
    }

    fn remove_if_locked(store: &mut Store, wire_key: &str, data: &[u8]) -> Result<bool> {
        if !Self::holds(store, wire_key, data)? {
            return Ok(false);
        }
        store.remove(wire_key);
        Ok(true)
    }

    /// Whether the key currently stores exactly `data`
    fn holds(store: &mut Store, wire_key: &str, data: &[u8]) -> Result<bool> {
        Ok(matches!(store.value_for_update(wire_key)?, Some(current) if current.as_slice() == data))
    }

    fn set_if_not_exists_locked(store: &mut Store, wire_key: &str, data: &[u8]) -> bool {
        if store.contains(wire_key) {
            return false;
        }
        store.put_value(wire_key, data.to_vec());
        true
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DbBackend for MemoryBackend {
    fn is_connected(&self) -> Result<bool> {
        Ok(true)
    }

    fn close(&self) {
        self.dispatcher.shutdown();
    }

    fn describe(&self) -> String {
        format!("in-memory backend ({} keys)", self.key_count())
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    fn set(&self, ns: &str, data: &HashMap<String, Vec<u8>>) -> Result<()> {
        let mut store = self.store.lock();
        for (key, value) in data {
            store.put_value(&keyspace::ns_key(ns, key), value.clone());
        }
        Ok(())
    }

    fn set_if(&self, ns: &str, key: &str, old_data: &[u8], new_data: &[u8]) -> Result<bool> {
        let mut store = self.store.lock();
        Self::set_if_locked(&mut store, &keyspace::ns_key(ns, key), old_data, new_data)
    }

    fn set_if_not_exists(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        let mut store = self.store.lock();
        Ok(Self::set_if_not_exists_locked(&mut store, &keyspace::ns_key(ns, key), data))
    }

    fn get(&self, ns: &str, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        let mut store = self.store.lock();
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = store.get_value(&keyspace::ns_key(ns, key)) {
                found.insert(key.clone(), value.clone());
            }
        }
        Ok(found)
    }

    fn find_keys(&self, ns: &str, pattern: &str) -> Result<Vec<String>> {
        let prefix = keyspace::ns_prefix(ns);
        let wire_keys = self.store.lock().scan(&prefix, pattern);
        wire_keys
            .iter()
            .map(|wire| keyspace::strip_ns(ns, wire).map(str::to_string))
            .collect()
    }

    fn find_and_get(&self, ns: &str, pattern: &str) -> Result<HashMap<String, Vec<u8>>> {
        let prefix = keyspace::ns_prefix(ns);
        let mut store = self.store.lock();
        let mut found = HashMap::new();
        for wire in store.scan(&prefix, pattern) {
            if let Some(value) = store.get_value(&wire) {
                found.insert(keyspace::strip_ns(ns, &wire)?.to_string(), value.clone());
            }
        }
        Ok(found)
    }

    fn remove(&self, ns: &str, keys: &[String]) -> Result<()> {
        let mut store = self.store.lock();
        for key in keys {
            store.remove(&keyspace::ns_key(ns, key));
        }
        Ok(())
    }

    fn remove_if(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        let mut store = self.store.lock();
        Self::remove_if_locked(&mut store, &keyspace::ns_key(ns, key), data)
    }

    // =========================================================================
    // Group Operations
    // =========================================================================

    fn add_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()> {
        let mut store = self.store.lock();
        if let Some(set) = store.group_mut(&keyspace::ns_key(ns, group), true)? {
            set.extend(members.iter().cloned());
        }
        Ok(())
    }

    fn remove_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()> {
        let wire = keyspace::ns_key(ns, group);
        let mut store = self.store.lock();
        if let Some(set) = store.group_mut(&wire, false)? {
            for member in members {
                set.remove(member);
            }
        }
        store.drop_if_empty_group(&wire);
        Ok(())
    }

    fn remove_group(&self, ns: &str, group: &str) -> Result<()> {
        self.store.lock().remove(&keyspace::ns_key(ns, group));
        Ok(())
    }

    fn get_members(&self, ns: &str, group: &str) -> Result<HashSet<Vec<u8>>> {
        let mut store = self.store.lock();
        Ok(store
            .group_mut(&keyspace::ns_key(ns, group), false)?
            .map(|set| set.clone())
            .unwrap_or_default())
    }

    fn is_member(&self, ns: &str, group: &str, member: &[u8]) -> Result<bool> {
        let mut store = self.store.lock();
        Ok(store
            .group_mut(&keyspace::ns_key(ns, group), false)?
            .map(|set| set.contains(member))
            .unwrap_or(false))
    }

    fn group_size(&self, ns: &str, group: &str) -> Result<usize> {
        let mut store = self.store.lock();
        Ok(store
            .group_mut(&keyspace::ns_key(ns, group), false)?
            .map(|set| set.len())
            .unwrap_or(0))
    }

    // =========================================================================
    // Write + Publish
    // =========================================================================

    fn set_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        data: &HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        let mut store = self.store.lock();
        for (key, value) in data {
            store.put_value(&keyspace::ns_key(ns, key), value.clone());
        }
        self.publish(ns, channels_and_events);
        Ok(())
    }

    fn set_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        old_data: &[u8],
        new_data: &[u8],
    ) -> Result<bool> {
        let mut store = self.store.lock();
        let done = Self::set_if_locked(&mut store, &keyspace::ns_key(ns, key), old_data, new_data)?;
        if done {
            self.publish(ns, channels_and_events);
        }
        Ok(done)
    }

    fn set_if_not_exists_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        let mut store = self.store.lock();
        let done = Self::set_if_not_exists_locked(&mut store, &keyspace::ns_key(ns, key), data);
        if done {
            self.publish(ns, channels_and_events);
        }
        Ok(done)
    }

    fn remove_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        keys: &[String],
    ) -> Result<()> {
        let mut store = self.store.lock();
        for key in keys {
            store.remove(&keyspace::ns_key(ns, key));
        }
        self.publish(ns, channels_and_events);
        Ok(())
    }

    fn remove_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        let mut store = self.store.lock();
        let done = Self::remove_if_locked(&mut store, &keyspace::ns_key(ns, key), data)?;
        if done {
            self.publish(ns, channels_and_events);
        }
        Ok(done)
    }

    fn remove_all_and_publish(&self, ns: &str, channels_and_events: &ChannelsAndEvents) -> Result<()> {
        let prefix = keyspace::ns_prefix(ns);
        let mut store = self.store.lock();
        for wire in store.scan(&prefix, "*") {
            store.remove(&wire);
        }
        self.publish(ns, channels_and_events);
        Ok(())
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    fn subscribe_channel(&self, ns: &str, callback: EventCallback, channels: &[String]) -> Result<()> {
        for channel in channels {
            self.dispatcher
                .register(keyspace::ns_key(ns, channel), channel.clone(), callback.clone());
        }
        Ok(())
    }

    fn unsubscribe_channel(&self, ns: &str, channels: &[String]) -> Result<()> {
        for channel in channels {
            self.dispatcher.unregister(&keyspace::ns_key(ns, channel));
        }
        Ok(())
    }

    fn start_event_listener(&self) -> Result<()> {
        if self.dispatcher.subscription_count() == 0 {
            return Err(SdlError::RejectedByBackend(
                "cannot start event listener without subscribed channels".to_string(),
            ));
        }
        self.dispatcher.start()
    }

    fn handle_events(&self) -> Result<Option<Event>> {
        self.dispatcher.poll()
    }

    // =========================================================================
    // Lock Primitives
    // =========================================================================

    fn lock_acquire(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool> {
        let wire = keyspace::ns_key(ns, name);
        let mut store = self.store.lock();
        if store.contains(&wire) {
            return Ok(false);
        }
        store.put_expiring(&wire, token.as_bytes().to_vec(), expiration);
        Ok(true)
    }

    fn lock_release(&self, ns: &str, name: &str, token: &str) -> Result<bool> {
        let mut store = self.store.lock();
        Self::remove_if_locked(&mut store, &keyspace::ns_key(ns, name), token.as_bytes())
    }

    fn lock_refresh(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool> {
        let wire = keyspace::ns_key(ns, name);
        let mut store = self.store.lock();
        let held = Self::holds(&mut store, &wire, token.as_bytes())?;
        Ok(held && store.expire(&wire, expiration))
    }

    fn lock_validity(&self, ns: &str, name: &str, token: &str) -> Result<Duration> {
        let wire = keyspace::ns_key(ns, name);
        let mut store = self.store.lock();
        let holder = store.value_for_update(&wire)?.cloned();
        match holder {
            None => Err(SdlError::RejectedByBackend(format!(
                "lock '{}' is not held by anyone",
                name
            ))),
            Some(current) if current.as_slice() != token.as_bytes() => Err(SdlError::RejectedByBackend(
                format!("lock '{}' is held by another owner", name),
            )),
            Some(_) => store.ttl(&wire).ok_or_else(|| {
                SdlError::RejectedByBackend(format!("lock '{}' has no expiration", name))
            }),
        }
    }

    fn lock_holder(&self, ns: &str, name: &str) -> Result<Option<String>> {
        let mut store = self.store.lock();
        Ok(store
            .value_for_update(&keyspace::ns_key(ns, name))?
            .map(|token| String::from_utf8_lossy(token).into_owned()))
    }
}
