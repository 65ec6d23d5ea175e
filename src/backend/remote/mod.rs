//! Networked Backend
//!
//! Implements the backend contract on top of one or more Redis endpoints.
//!
//! ## Responsibilities
//! - Route each namespace to one shard by `crc32(namespace) % shard_count`
//! - Run plain commands over a pooled connection of that shard
//! - Run guarded writes, write+publish combinators and lock primitives as
//!   server-side scripts so each is one indivisible step
//! - Keep one pub/sub reader and one event dispatcher per shard
//!
//! ## Sharding
//! ```text
//!   namespace ──crc32 % n──▶ shard i ──┬── r2d2 pool      (commands, scripts)
//!                                      ├── pub/sub reader  (subscriptions)
//!                                      └── dispatcher      (callbacks)
//! ```
//! Everything belonging to one namespace (keys, groups, locks, channels) lives
//! on the same shard, so scripts never cross shards.

mod scripts;
mod shard;
mod subscriber;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::Config;
use crate::error::{Result, SdlError};
use crate::events::{DeliveryMode, Event, EventCallback};
use crate::keyspace::{self, ChannelsAndEvents};

use self::scripts::{push_channels, Scripts, LOCK_HELD_BY_OTHER, LOCK_NOT_HELD};
use self::shard::{scan_keys, shard_index, Shard};

use super::DbBackend;

/// Backend over one or more Redis endpoints
pub struct RedisBackend {
    shards: Vec<Shard>,
    scripts: Scripts,

    /// Shard polled first by the next `handle_events()`
    poll_cursor: AtomicUsize,
}

impl RedisBackend {
    /// Prepare a shard per configured endpoint
    ///
    /// No connection is opened here; an unreachable store surfaces as
    /// `NotConnected` on the first operation.
    pub fn connect(config: &Config) -> Result<Self> {
        let endpoints = config.endpoints();
        if endpoints.is_empty() {
            return Err(SdlError::Config(format!(
                "no store address configured, set {} or {}",
                Config::ENV_HOST,
                Config::ENV_ADDRS
            )));
        }

        let shards = endpoints
            .into_iter()
            .enumerate()
            .map(|(i, endpoint)| Shard::new(i, endpoint, config))
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            shards = shards.len(),
            endpoints = %shards.iter().map(|s| s.endpoint.to_string()).collect::<Vec<_>>().join(", "),
            "redis backend ready"
        );

        Ok(Self {
            shards,
            scripts: Scripts::new(),
            poll_cursor: AtomicUsize::new(0),
        })
    }

    /// Number of shards namespaces are spread over
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard(&self, ns: &str) -> &Shard {
        &self.shards[shard_index(ns, self.shards.len())]
    }

    fn scan(&self, ns: &str, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.shard(ns).conn()?;
        scan_keys(&mut conn, &keyspace::ns_pattern(ns, pattern))
    }

    /// Lock validity results below zero, mapped to errors
    fn validity_error(name: &str, code: i64) -> SdlError {
        let reason = match code {
            LOCK_NOT_HELD | -2 => "is not held by anyone",
            LOCK_HELD_BY_OTHER => "is held by another owner",
            -1 => "has no expiration",
            _ => "returned an unexpected validity",
        };
        SdlError::RejectedByBackend(format!("lock '{}' {} ({})", name, reason, code))
    }
}

impl DbBackend for RedisBackend {
    fn is_connected(&self) -> Result<bool> {
        for shard in &self.shards {
            if !shard.ping()? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn close(&self) {
        for shard in &self.shards {
            shard.close();
        }
    }

    fn describe(&self) -> String {
        let endpoints: Vec<String> = self.shards.iter().map(|s| s.endpoint.to_string()).collect();
        format!("redis backend [{}]", endpoints.join(", "))
    }

    // =========================================================================
    // Point Operations
    // =========================================================================

    fn set(&self, ns: &str, data: &HashMap<String, Vec<u8>>) -> Result<()> {
        tracing::debug!(ns, keys = data.len(), "set");
        let mut cmd = redis::cmd("MSET");
        for (key, value) in data {
            cmd.arg(keyspace::ns_key(ns, key)).arg(value);
        }
        let mut conn = self.shard(ns).conn()?;
        cmd.query::<()>(&mut *conn)?;
        Ok(())
    }

    fn set_if(&self, ns: &str, key: &str, old_data: &[u8], new_data: &[u8]) -> Result<bool> {
        tracing::debug!(ns, key, "set_if");
        let mut conn = self.shard(ns).conn()?;
        let done: i64 = self
            .scripts
            .set_if
            .key(keyspace::ns_key(ns, key))
            .arg(new_data)
            .arg(old_data)
            .invoke(&mut *conn)?;
        Ok(done == 1)
    }

    fn set_if_not_exists(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        tracing::debug!(ns, key, "set_if_not_exists");
        let mut conn = self.shard(ns).conn()?;
        let done: bool = redis::cmd("SETNX")
            .arg(keyspace::ns_key(ns, key))
            .arg(data)
            .query(&mut *conn)?;
        Ok(done)
    }

    fn get(&self, ns: &str, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        tracing::debug!(ns, keys = keys.len(), "get");
        let mut conn = self.shard(ns).conn()?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(keyspace::ns_keys(ns, keys))
            .query(&mut *conn)?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    fn find_keys(&self, ns: &str, pattern: &str) -> Result<Vec<String>> {
        tracing::debug!(ns, pattern, "find_keys");
        self.scan(ns, pattern)?
            .iter()
            .map(|wire| keyspace::strip_ns(ns, wire).map(str::to_string))
            .collect()
    }

    fn find_and_get(&self, ns: &str, pattern: &str) -> Result<HashMap<String, Vec<u8>>> {
        tracing::debug!(ns, pattern, "find_and_get");
        let wires = self.scan(ns, pattern)?;
        if wires.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.shard(ns).conn()?;
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET").arg(&wires).query(&mut *conn)?;

        let mut found = HashMap::with_capacity(wires.len());
        for (wire, value) in wires.iter().zip(values) {
            // removed between scan and read
            if let Some(value) = value {
                found.insert(keyspace::strip_ns(ns, wire)?.to_string(), value);
            }
        }
        Ok(found)
    }

    fn remove(&self, ns: &str, keys: &[String]) -> Result<()> {
        tracing::debug!(ns, keys = keys.len(), "remove");
        let mut conn = self.shard(ns).conn()?;
        redis::cmd("DEL")
            .arg(keyspace::ns_keys(ns, keys))
            .query::<()>(&mut *conn)?;
        Ok(())
    }

    fn remove_if(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        tracing::debug!(ns, key, "remove_if");
        let mut conn = self.shard(ns).conn()?;
        let done: i64 = self
            .scripts
            .remove_if
            .key(keyspace::ns_key(ns, key))
            .arg(data)
            .invoke(&mut *conn)?;
        Ok(done == 1)
    }

    // =========================================================================
    // Group Operations
    // =========================================================================

    fn add_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()> {
        tracing::debug!(ns, group, members = members.len(), "add_member");
        let mut cmd = redis::cmd("SADD");
        cmd.arg(keyspace::ns_key(ns, group));
        for member in members {
            cmd.arg(member);
        }
        let mut conn = self.shard(ns).conn()?;
        cmd.query::<()>(&mut *conn)?;
        Ok(())
    }

    fn remove_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()> {
        tracing::debug!(ns, group, members = members.len(), "remove_member");
        let mut cmd = redis::cmd("SREM");
        cmd.arg(keyspace::ns_key(ns, group));
        for member in members {
            cmd.arg(member);
        }
        let mut conn = self.shard(ns).conn()?;
        cmd.query::<()>(&mut *conn)?;
        Ok(())
    }

    fn remove_group(&self, ns: &str, group: &str) -> Result<()> {
        tracing::debug!(ns, group, "remove_group");
        let mut conn = self.shard(ns).conn()?;
        redis::cmd("DEL")
            .arg(keyspace::ns_key(ns, group))
            .query::<()>(&mut *conn)?;
        Ok(())
    }

    fn get_members(&self, ns: &str, group: &str) -> Result<HashSet<Vec<u8>>> {
        let mut conn = self.shard(ns).conn()?;
        let members: HashSet<Vec<u8>> = redis::cmd("SMEMBERS")
            .arg(keyspace::ns_key(ns, group))
            .query(&mut *conn)?;
        Ok(members)
    }

    fn is_member(&self, ns: &str, group: &str, member: &[u8]) -> Result<bool> {
        let mut conn = self.shard(ns).conn()?;
        let found: bool = redis::cmd("SISMEMBER")
            .arg(keyspace::ns_key(ns, group))
            .arg(member)
            .query(&mut *conn)?;
        Ok(found)
    }

    fn group_size(&self, ns: &str, group: &str) -> Result<usize> {
        let mut conn = self.shard(ns).conn()?;
        let size: usize = redis::cmd("SCARD")
            .arg(keyspace::ns_key(ns, group))
            .query(&mut *conn)?;
        Ok(size)
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
        tracing::debug!(ns, keys = data.len(), channels = channels_and_events.len(), "set_and_publish");
        let prepared = keyspace::prepare_channels(ns, channels_and_events);
        let mut invocation = self.scripts.set_and_publish.prepare_invoke();
        // KEYS and the leading ARGV values stay positionally aligned
        for (key, value) in data {
            invocation.key(keyspace::ns_key(ns, key)).arg(value);
        }
        push_channels(&mut invocation, &prepared);

        let mut conn = self.shard(ns).conn()?;
        invocation.invoke::<i64>(&mut *conn)?;
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
        tracing::debug!(ns, key, "set_if_and_publish");
        let prepared = keyspace::prepare_channels(ns, channels_and_events);
        let mut invocation = self.scripts.set_if_and_publish.prepare_invoke();
        invocation.key(keyspace::ns_key(ns, key)).arg(new_data).arg(old_data);
        push_channels(&mut invocation, &prepared);

        let mut conn = self.shard(ns).conn()?;
        let done: i64 = invocation.invoke(&mut *conn)?;
        Ok(done == 1)
    }

    fn set_if_not_exists_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        tracing::debug!(ns, key, "set_if_not_exists_and_publish");
        let prepared = keyspace::prepare_channels(ns, channels_and_events);
        let mut invocation = self.scripts.set_if_not_exists_and_publish.prepare_invoke();
        invocation.key(keyspace::ns_key(ns, key)).arg(data);
        push_channels(&mut invocation, &prepared);

        let mut conn = self.shard(ns).conn()?;
        let done: i64 = invocation.invoke(&mut *conn)?;
        Ok(done == 1)
    }

    fn remove_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        keys: &[String],
    ) -> Result<()> {
        tracing::debug!(ns, keys = keys.len(), "remove_and_publish");
        let prepared = keyspace::prepare_channels(ns, channels_and_events);
        let mut invocation = self.scripts.remove_and_publish.prepare_invoke();
        for key in keys {
            invocation.key(keyspace::ns_key(ns, key));
        }
        push_channels(&mut invocation, &prepared);

        let mut conn = self.shard(ns).conn()?;
        invocation.invoke::<i64>(&mut *conn)?;
        Ok(())
    }

    fn remove_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        tracing::debug!(ns, key, "remove_if_and_publish");
        let prepared = keyspace::prepare_channels(ns, channels_and_events);
        let mut invocation = self.scripts.remove_if_and_publish.prepare_invoke();
        invocation.key(keyspace::ns_key(ns, key)).arg(data);
        push_channels(&mut invocation, &prepared);

        let mut conn = self.shard(ns).conn()?;
        let done: i64 = invocation.invoke(&mut *conn)?;
        Ok(done == 1)
    }

    fn remove_all_and_publish(&self, ns: &str, channels_and_events: &ChannelsAndEvents) -> Result<()> {
        tracing::debug!(ns, "remove_all_and_publish");
        let keys = self.find_keys(ns, "*")?;
        self.remove_and_publish(ns, channels_and_events, &keys)
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    fn subscribe_channel(&self, ns: &str, callback: EventCallback, channels: &[String]) -> Result<()> {
        let shard = self.shard(ns);
        let wires = keyspace::ns_keys(ns, channels);
        for (wire, channel) in wires.iter().zip(channels) {
            shard
                .dispatcher
                .register(wire.clone(), channel.clone(), callback.clone());
        }
        if let Err(e) = shard.subscriber.subscribe(&wires) {
            for wire in &wires {
                shard.dispatcher.unregister(wire);
            }
            return Err(e);
        }
        tracing::debug!(ns, channels = channels.len(), "subscribed");
        Ok(())
    }

    fn unsubscribe_channel(&self, ns: &str, channels: &[String]) -> Result<()> {
        let shard = self.shard(ns);
        let wires = keyspace::ns_keys(ns, channels);
        for wire in &wires {
            shard.dispatcher.unregister(wire);
        }
        shard.subscriber.unsubscribe(&wires)?;
        tracing::debug!(ns, channels = channels.len(), "unsubscribed");
        Ok(())
    }

    fn start_event_listener(&self) -> Result<()> {
        let subscriptions: usize = self.shards.iter().map(|s| s.dispatcher.subscription_count()).sum();
        if subscriptions == 0 {
            return Err(SdlError::RejectedByBackend(
                "cannot start event listener without subscribed channels".to_string(),
            ));
        }
        // decide for every shard before starting any
        if let Some(shard) = self.shards.iter().find(|s| s.dispatcher.mode() != DeliveryMode::Idle) {
            return shard.dispatcher.start();
        }
        for shard in &self.shards {
            shard.dispatcher.start()?;
        }
        Ok(())
    }

    fn handle_events(&self) -> Result<Option<Event>> {
        if self.shards.iter().any(|s| s.dispatcher.mode() == DeliveryMode::Managed) {
            return Err(SdlError::RejectedByBackend(
                "event listener already started".to_string(),
            ));
        }
        let count = self.shards.len();
        let start = self.poll_cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..count {
            let shard = &self.shards[(start + offset) % count];
            if let Some(event) = shard.dispatcher.poll()? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    // =========================================================================
    // Lock Primitives
    // =========================================================================

    fn lock_acquire(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool> {
        let mut conn = self.shard(ns).conn()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(keyspace::ns_key(ns, name))
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(millis(expiration))
            .query(&mut *conn)?;
        Ok(reply.is_some())
    }

    fn lock_release(&self, ns: &str, name: &str, token: &str) -> Result<bool> {
        let mut conn = self.shard(ns).conn()?;
        let done: i64 = self
            .scripts
            .lock_release
            .key(keyspace::ns_key(ns, name))
            .arg(token)
            .invoke(&mut *conn)?;
        Ok(done == 1)
    }

    fn lock_refresh(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool> {
        let mut conn = self.shard(ns).conn()?;
        let done: i64 = self
            .scripts
            .lock_refresh
            .key(keyspace::ns_key(ns, name))
            .arg(token)
            .arg(millis(expiration))
            .invoke(&mut *conn)?;
        Ok(done == 1)
    }

    fn lock_validity(&self, ns: &str, name: &str, token: &str) -> Result<Duration> {
        let mut conn = self.shard(ns).conn()?;
        let remaining: i64 = self
            .scripts
            .lock_validity
            .key(keyspace::ns_key(ns, name))
            .arg(token)
            .invoke(&mut *conn)?;
        if remaining < 0 {
            return Err(Self::validity_error(name, remaining));
        }
        Ok(Duration::from_millis(remaining as u64))
    }

    fn lock_holder(&self, ns: &str, name: &str) -> Result<Option<String>> {
        let mut conn = self.shard(ns).conn()?;
        let holder: Option<Vec<u8>> = redis::cmd("GET")
            .arg(keyspace::ns_key(ns, name))
            .query(&mut *conn)?;
        Ok(holder.map(|token| String::from_utf8_lossy(&token).into_owned()))
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        self.close();
    }
}

/// Whole milliseconds for PX/PEXPIRE, never zero and within the store's
/// signed 64-bit range
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, i64::MAX as u64)
}
