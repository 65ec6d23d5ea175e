//! In-memory key space
//!
//! HashMap of wire keys to typed entries with optional expiration. Expired
//! entries are purged lazily, whenever they are looked at.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::error::{Result, SdlError};
use crate::glob;

const WRONG_TYPE: &str = "WRONGTYPE Operation against a key holding the wrong kind of value";

/// Payload of a key
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    /// Opaque value
    Value(Vec<u8>),

    /// Unordered set of unique members
    Group(HashSet<Vec<u8>>),
}

#[derive(Debug)]
struct Entry {
    data: Data,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if deadline <= now)
    }
}

/// Typed key space of the in-memory backend
#[derive(Debug, Default)]
pub struct Store {
    entries: HashMap<String, Entry>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Values
    // =========================================================================

    /// Value of a key; a group key reads as absent
    pub fn get_value(&mut self, key: &str) -> Option<&Vec<u8>> {
        match self.live(key) {
            Some(Entry {
                data: Data::Value(value),
                ..
            }) => Some(&*value),
            _ => None,
        }
    }

    /// Value of a key for a conditional operation; a group key is rejected
    pub fn value_for_update(&mut self, key: &str) -> Result<Option<&Vec<u8>>> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Value(value),
                ..
            }) => Ok(Some(&*value)),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Write a value, replacing any entry and clearing its expiration
    pub fn put_value(&mut self, key: &str, value: Vec<u8>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Value(value),
                expires_at: None,
            },
        );
    }

    /// Write a value that expires after `ttl`
    pub fn put_expiring(&mut self, key: &str, value: Vec<u8>, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                data: Data::Value(value),
                expires_at: deadline(ttl),
            },
        );
    }

    /// Whether a live entry of any type exists
    pub fn contains(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    /// Remove an entry of any type
    pub fn remove(&mut self, key: &str) -> bool {
        self.purge_if_expired(key);
        self.entries.remove(key).is_some()
    }

    /// Reset the expiration of a live entry
    pub fn expire(&mut self, key: &str, ttl: Duration) -> bool {
        match self.live(key) {
            Some(entry) => {
                entry.expires_at = deadline(ttl);
                true
            }
            None => false,
        }
    }

    /// Remaining time to live; `None` for absent keys or keys without expiry
    pub fn ttl(&mut self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.live(key)
            .and_then(|entry| entry.expires_at)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    // =========================================================================
    // Groups
    // =========================================================================

    /// Mutable group of a key, created when `create` is set
    ///
    /// Returns `Ok(None)` for an absent group when not creating; a value key
    /// is rejected.
    pub fn group_mut(&mut self, key: &str, create: bool) -> Result<Option<&mut HashSet<Vec<u8>>>> {
        self.purge_if_expired(key);
        if create && !self.entries.contains_key(key) {
            self.entries.insert(
                key.to_string(),
                Entry {
                    data: Data::Group(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            None => Ok(None),
            Some(Entry {
                data: Data::Group(members),
                ..
            }) => Ok(Some(members)),
            Some(_) => Err(wrong_type()),
        }
    }

    /// Drop a group that became empty, as the networked store does
    pub fn drop_if_empty_group(&mut self, key: &str) {
        let empty = matches!(
            self.entries.get(key),
            Some(Entry { data: Data::Group(members), .. }) if members.is_empty()
        );
        if empty {
            self.entries.remove(key);
        }
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// Wire keys starting with `prefix` whose remainder matches `pattern`
    pub fn scan(&mut self, prefix: &str, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        self.entries
            .keys()
            .filter(|key| {
                key.strip_prefix(prefix)
                    .map(|rest| glob::matches(pattern, rest))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.values().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        self.purge_if_expired(key);
        self.entries.get_mut(key)
    }

    fn purge_if_expired(&mut self, key: &str) {
        let now = Instant::now();
        if self.entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            self.entries.remove(key);
        }
    }
}

fn wrong_type() -> SdlError {
    SdlError::RejectedByBackend(WRONG_TYPE.to_string())
}

/// Expiry instant `ttl` from now; a `ttl` past the clock's range never expires
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}
