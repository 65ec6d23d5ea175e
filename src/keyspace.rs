//! Wire encoding of namespaced identifiers
//!
//! ## Format
//! ```text
//! "{" + namespace + "}," + key
//! ```
//! The brace-wrapped namespace doubles as a hash tag, so every key, group,
//! lock and channel of one namespace lands on the same store partition.
//!
//! Several events addressed to one channel travel as a single payload joined
//! with [`EVENT_SEPARATOR`], which is therefore reserved in event text.

use std::collections::HashMap;

use crate::error::{Result, SdlError};

/// Joins multiple events of one channel on the wire
pub const EVENT_SEPARATOR: &str = "___";

/// Channel name mapped to the events to publish on it
pub type ChannelsAndEvents = HashMap<String, Vec<String>>;

/// Encode a namespaced key
pub fn ns_key(ns: &str, key: &str) -> String {
    let mut out = String::with_capacity(ns.len() + key.len() + 3);
    out.push('{');
    out.push_str(ns);
    out.push_str("},");
    out.push_str(key);
    out
}

/// Encode several keys of one namespace
pub fn ns_keys<'a, I>(ns: &str, keys: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    keys.into_iter().map(|k| ns_key(ns, k)).collect()
}

/// Prefix shared by every wire key of a namespace
pub fn ns_prefix(ns: &str) -> String {
    ns_key(ns, "")
}

/// Recover the caller's key from a wire key of `ns`
///
/// Strips the exact namespace prefix, so namespaces may contain any
/// character. Keys of another namespace are rejected.
pub fn strip_ns<'a>(ns: &str, wire: &'a str) -> Result<&'a str> {
    wire.strip_prefix('{')
        .and_then(|rest| rest.strip_prefix(ns))
        .and_then(|rest| rest.strip_prefix("},"))
        .ok_or_else(|| {
            SdlError::RejectedByBackend(format!("key '{}' is not in namespace '{}'", wire, ns))
        })
}

/// Build the store-side scan pattern for `pattern` inside `ns`
///
/// Glob metacharacters in the namespace are escaped so that a namespace never
/// matches keys of another namespace.
pub fn ns_pattern(ns: &str, pattern: &str) -> String {
    let mut out = String::with_capacity(ns.len() + pattern.len() + 3);
    out.push('{');
    for c in ns.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push_str("},");
    out.push_str(pattern);
    out
}

/// Reject events carrying the reserved separator
pub fn validate_events(channels_and_events: &ChannelsAndEvents) -> Result<()> {
    for (channel, events) in channels_and_events {
        for event in events {
            if event.contains(EVENT_SEPARATOR) {
                return Err(SdlError::Misuse(format!(
                    "event '{}' on channel '{}' contains the reserved substring \"{}\"",
                    event, channel, EVENT_SEPARATOR
                )));
            }
        }
    }
    Ok(())
}

/// Flatten channel/event pairs into wire form
///
/// Each channel with at least one event yields its namespaced name followed by
/// its events joined with the separator. Channels without events are skipped.
pub fn prepare_channels(ns: &str, channels_and_events: &ChannelsAndEvents) -> Vec<(String, String)> {
    let mut prepared: Vec<(String, String)> = channels_and_events
        .iter()
        .filter(|(_, events)| !events.is_empty())
        .map(|(channel, events)| (ns_key(ns, channel), events.join(EVENT_SEPARATOR)))
        .collect();
    // stable publish order for a given input
    prepared.sort();
    prepared
}

/// Split a wire payload back into events
pub fn split_events(payload: &str) -> Vec<String> {
    payload.split(EVENT_SEPARATOR).map(str::to_string).collect()
}
