//! Typed value layer
//!
//! Stores any `serde` value by encoding it with `bincode` before it reaches
//! the storage facade. Values written through this layer must be read back
//! through it with the same type; the byte layout is bincode's.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::storage::SyncStorage;

/// Serializing view over a [`SyncStorage`]
#[derive(Clone, Copy)]
pub struct TypedStorage<'a> {
    storage: &'a SyncStorage,
}

impl<'a> TypedStorage<'a> {
    pub fn new(storage: &'a SyncStorage) -> Self {
        Self { storage }
    }

    /// The underlying raw storage
    pub fn raw(&self) -> &'a SyncStorage {
        self.storage
    }

    // =========================================================================
    // Values
    // =========================================================================

    pub fn set<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<()> {
        let mut data = HashMap::with_capacity(1);
        data.insert(key.to_string(), encode(value)?);
        self.storage.set(ns, &data)
    }

    pub fn set_if<T: Serialize>(&self, ns: &str, key: &str, old_value: &T, new_value: &T) -> Result<bool> {
        self.storage
            .set_if(ns, key, &encode(old_value)?, &encode(new_value)?)
    }

    pub fn set_if_not_exists<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<bool> {
        self.storage.set_if_not_exists(ns, key, &encode(value)?)
    }

    /// Decoded value of `key`, `None` when absent
    pub fn get<T: DeserializeOwned>(&self, ns: &str, key: &str) -> Result<Option<T>> {
        match self.storage.get(ns, [key])?.remove(key) {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Decoded values of every key starting with `prefix`
    pub fn find_and_get<T: DeserializeOwned>(&self, ns: &str, prefix: &str) -> Result<BTreeMap<String, T>> {
        self.storage
            .find_and_get(ns, &format!("{}*", escape_glob(prefix)))?
            .into_iter()
            .map(|(key, bytes)| decode(&bytes).map(|value| (key, value)))
            .collect()
    }

    pub fn remove_if<T: Serialize>(&self, ns: &str, key: &str, value: &T) -> Result<bool> {
        self.storage.remove_if(ns, key, &encode(value)?)
    }

    // =========================================================================
    // Groups
    // =========================================================================

    pub fn add_member<T: Serialize>(&self, ns: &str, group: &str, member: &T) -> Result<()> {
        self.storage.add_member(ns, group, [encode(member)?])
    }

    pub fn remove_member<T: Serialize>(&self, ns: &str, group: &str, member: &T) -> Result<()> {
        self.storage.remove_member(ns, group, [encode(member)?])
    }

    pub fn is_member<T: Serialize>(&self, ns: &str, group: &str, member: &T) -> Result<bool> {
        self.storage.is_member(ns, group, &encode(member)?)
    }

    /// Decoded members; fails if any member does not decode as `T`
    pub fn get_members<T>(&self, ns: &str, group: &str) -> Result<HashSet<T>>
    where
        T: DeserializeOwned + Eq + std::hash::Hash,
    {
        self.storage
            .get_members(ns, group)?
            .iter()
            .map(|bytes| decode(bytes))
            .collect()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// Escape glob metacharacters so a prefix matches literally
fn escape_glob(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
