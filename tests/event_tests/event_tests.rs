//! Tests for notifications
//!
//! These tests verify:
//! - Write+publish combinators notify only when the write took effect
//! - Polled and managed delivery, and their mutual exclusion
//! - Event ordering and separator validation
//! - Unsubscribing stops delivery

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use sdlkv::{ChannelsAndEvents, SdlError, SyncStorage};

// =============================================================================
// Helper Functions
// =============================================================================

type Seen = Arc<Mutex<Vec<(String, Vec<String>)>>>;

fn events(channel: &str, items: &[&str]) -> ChannelsAndEvents {
    let mut map = ChannelsAndEvents::new();
    map.insert(channel.to_string(), items.iter().map(|e| e.to_string()).collect());
    map
}

fn data(key: &str, value: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut map = HashMap::new();
    map.insert(key.to_string(), value.to_vec());
    map
}

/// Subscribe a recording callback to `channel`
fn recorder(sdl: &SyncStorage, ns: &str, channel: &str) -> Seen {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    sdl.subscribe_channel(
        ns,
        move |ch: &str, evs: &[String]| sink.lock().push((ch.to_string(), evs.to_vec())),
        [channel],
    )
    .unwrap();
    seen
}

/// Subscribe a callback forwarding into a channel, for managed delivery
fn forwarder(sdl: &SyncStorage, ns: &str, channel: &str) -> Receiver<(String, Vec<String>)> {
    let (tx, rx) = channel::unbounded();
    sdl.subscribe_channel(
        ns,
        move |ch: &str, evs: &[String]| {
            let _ = tx.send((ch.to_string(), evs.to_vec()));
        },
        [channel],
    )
    .unwrap();
    rx
}

fn drain(sdl: &SyncStorage) -> Vec<(String, Vec<String>)> {
    let mut out = Vec::new();
    while let Some(event) = sdl.handle_events().unwrap() {
        out.push(event);
    }
    out
}

// =============================================================================
// Publish-on-success Tests
// =============================================================================

#[test]
fn test_set_and_publish_delivers() {
    let sdl = SyncStorage::in_memory();
    let seen = recorder(&sdl, "ns", "ch");

    sdl.set_and_publish("ns", &events("ch", &["e1"]), &data("k", b"v"))
        .unwrap();

    let event = sdl.handle_events().unwrap();
    assert_eq!(event, Some(("ch".to_string(), vec!["e1".to_string()])));
    assert_eq!(seen.lock().len(), 1);
    assert_eq!(sdl.get("ns", ["k"]).unwrap()["k"], b"v".to_vec());
}

#[test]
fn test_set_if_and_publish_failed_guard_is_silent() {
    let sdl = SyncStorage::in_memory();
    let seen = recorder(&sdl, "ns", "ch");
    sdl.set("ns", &data("k", b"current")).unwrap();

    let done = sdl
        .set_if_and_publish("ns", &events("ch", &["changed"]), "k", b"stale", b"new")
        .unwrap();

    assert!(!done);
    assert!(drain(&sdl).is_empty());
    assert!(seen.lock().is_empty());
    assert_eq!(sdl.get("ns", ["k"]).unwrap()["k"], b"current".to_vec());
}

#[test]
fn test_set_if_and_publish_success_delivers() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns", "ch");
    sdl.set("ns", &data("k", b"current")).unwrap();

    assert!(sdl
        .set_if_and_publish("ns", &events("ch", &["changed"]), "k", b"current", b"new")
        .unwrap());

    assert_eq!(drain(&sdl).len(), 1);
}

#[test]
fn test_set_if_not_exists_and_publish_once() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns", "ch");

    assert!(sdl
        .set_if_not_exists_and_publish("ns", &events("ch", &["created"]), "k", b"v")
        .unwrap());
    assert!(!sdl
        .set_if_not_exists_and_publish("ns", &events("ch", &["created"]), "k", b"v")
        .unwrap());

    assert_eq!(drain(&sdl).len(), 1);
}

#[test]
fn test_remove_if_and_publish() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns", "ch");
    sdl.set("ns", &data("k", b"v")).unwrap();

    assert!(!sdl
        .remove_if_and_publish("ns", &events("ch", &["gone"]), "k", b"other")
        .unwrap());
    assert!(sdl
        .remove_if_and_publish("ns", &events("ch", &["gone"]), "k", b"v")
        .unwrap());

    assert_eq!(drain(&sdl), vec![("ch".to_string(), vec!["gone".to_string()])]);
}

#[test]
fn test_remove_and_remove_all_publish() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns", "ch");
    sdl.set("ns", &data("a", b"1")).unwrap();
    sdl.set("ns", &data("b", b"2")).unwrap();

    sdl.remove_and_publish("ns", &events("ch", &["a_removed"]), ["a"])
        .unwrap();
    sdl.remove_all_and_publish("ns", &events("ch", &["all_removed"]))
        .unwrap();

    let delivered = drain(&sdl);
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].1, vec!["all_removed".to_string()]);
    assert!(sdl.find_keys("ns", "*").unwrap().is_empty());
}

// =============================================================================
// Delivery Tests
// =============================================================================

#[test]
fn test_events_keep_publish_order() {
    let sdl = SyncStorage::in_memory();
    let seen = recorder(&sdl, "ns", "ch");

    for i in 0..5 {
        let event = format!("e{}", i);
        sdl.set_and_publish("ns", &events("ch", &[event.as_str()]), &data("k", b"v"))
            .unwrap();
    }
    drain(&sdl);

    let order: Vec<String> = seen.lock().iter().map(|(_, evs)| evs[0].clone()).collect();
    assert_eq!(order, vec!["e0", "e1", "e2", "e3", "e4"]);
}

#[test]
fn test_multiple_events_arrive_together() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns", "ch");

    sdl.set_and_publish("ns", &events("ch", &["e1", "e2"]), &data("k", b"v"))
        .unwrap();

    assert_eq!(
        drain(&sdl),
        vec![("ch".to_string(), vec!["e1".to_string(), "e2".to_string()])]
    );
}

#[test]
fn test_event_with_separator_is_misuse() {
    let sdl = SyncStorage::in_memory();

    let err = sdl
        .set_and_publish("ns", &events("ch", &["bad___event"]), &data("k", b"v"))
        .unwrap_err();

    assert!(matches!(err, SdlError::Misuse(_)));
    assert!(sdl.get("ns", ["k"]).unwrap().is_empty());
}

#[test]
fn test_unsubscribed_channel_gets_nothing() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns", "ch");

    sdl.unsubscribe_channel("ns", ["ch"]).unwrap();
    sdl.set_and_publish("ns", &events("ch", &["e"]), &data("k", b"v"))
        .unwrap();

    assert!(drain(&sdl).is_empty());
}

#[test]
fn test_other_namespace_channel_not_delivered() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns1", "ch");

    sdl.set_and_publish("ns2", &events("ch", &["e"]), &data("k", b"v"))
        .unwrap();

    assert!(drain(&sdl).is_empty());
}

#[test]
fn test_managed_listener_delivers() {
    let sdl = SyncStorage::in_memory();
    let rx = forwarder(&sdl, "ns", "ch");
    sdl.start_event_listener().unwrap();

    sdl.set_and_publish("ns", &events("ch", &["e1"]), &data("k", b"v"))
        .unwrap();

    let (channel, evs) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(channel, "ch");
    assert_eq!(evs, vec!["e1".to_string()]);
}

#[test]
fn test_namespace_with_comma_keeps_channel_name() {
    let sdl = SyncStorage::in_memory();
    let seen = recorder(&sdl, "a,b", "ch");

    sdl.set_and_publish("a,b", &events("ch", &["e"]), &data("k", b"v"))
        .unwrap();

    assert_eq!(drain(&sdl), vec![("ch".to_string(), vec!["e".to_string()])]);
    assert_eq!(seen.lock()[0].0, "ch");
}

// =============================================================================
// Mode Exclusion Tests
// =============================================================================

#[test]
fn test_listener_without_subscriptions_is_rejected() {
    let sdl = SyncStorage::in_memory();

    assert!(matches!(
        sdl.start_event_listener(),
        Err(SdlError::RejectedByBackend(_))
    ));
}

#[test]
fn test_listener_cannot_start_twice() {
    let sdl = SyncStorage::in_memory();
    let _rx = forwarder(&sdl, "ns", "ch");

    sdl.start_event_listener().unwrap();

    assert!(sdl.start_event_listener().is_err());
}

#[test]
fn test_polling_after_listener_is_rejected() {
    let sdl = SyncStorage::in_memory();
    let _rx = forwarder(&sdl, "ns", "ch");
    sdl.start_event_listener().unwrap();

    assert!(matches!(
        sdl.handle_events(),
        Err(SdlError::RejectedByBackend(_))
    ));
}

#[test]
fn test_listener_after_polling_is_rejected() {
    let sdl = SyncStorage::in_memory();
    let _seen = recorder(&sdl, "ns", "ch");
    assert_eq!(sdl.handle_events().unwrap(), None);

    assert!(sdl.start_event_listener().is_err());
}
