//! Tests for SyncLock
//!
//! These tests verify:
//! - Exclusive acquisition across handles and threads
//! - Release and refresh only by the holder
//! - Validity time and expiry
//! - Retry timing of acquire
//! - Recovery from transient backend failures and closed storage

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use sdlkv::backend::{DbBackend, MemoryBackend};
use sdlkv::{ChannelsAndEvents, Event, EventCallback, LockStatus, Result, SdlError, SyncLock, SyncStorage};

// =============================================================================
// Helper Functions
// =============================================================================

const SHORT_RETRY: Duration = Duration::from_millis(10);

fn setup_storage() -> Arc<SyncStorage> {
    Arc::new(SyncStorage::in_memory())
}

/// In-memory backend whose next lock release fails before reaching the store
#[derive(Default)]
struct FlakyReleaseBackend {
    inner: MemoryBackend,
    fail_next_release: AtomicBool,
}

impl DbBackend for FlakyReleaseBackend {
    fn is_connected(&self) -> Result<bool> {
        self.inner.is_connected()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn set(&self, ns: &str, data: &HashMap<String, Vec<u8>>) -> Result<()> {
        self.inner.set(ns, data)
    }

    fn set_if(&self, ns: &str, key: &str, old_data: &[u8], new_data: &[u8]) -> Result<bool> {
        self.inner.set_if(ns, key, old_data, new_data)
    }

    fn set_if_not_exists(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        self.inner.set_if_not_exists(ns, key, data)
    }

    fn get(&self, ns: &str, keys: &[String]) -> Result<HashMap<String, Vec<u8>>> {
        self.inner.get(ns, keys)
    }

    fn find_keys(&self, ns: &str, pattern: &str) -> Result<Vec<String>> {
        self.inner.find_keys(ns, pattern)
    }

    fn find_and_get(&self, ns: &str, pattern: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.inner.find_and_get(ns, pattern)
    }

    fn remove(&self, ns: &str, keys: &[String]) -> Result<()> {
        self.inner.remove(ns, keys)
    }

    fn remove_if(&self, ns: &str, key: &str, data: &[u8]) -> Result<bool> {
        self.inner.remove_if(ns, key, data)
    }

    fn add_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()> {
        self.inner.add_member(ns, group, members)
    }

    fn remove_member(&self, ns: &str, group: &str, members: &HashSet<Vec<u8>>) -> Result<()> {
        self.inner.remove_member(ns, group, members)
    }

    fn remove_group(&self, ns: &str, group: &str) -> Result<()> {
        self.inner.remove_group(ns, group)
    }

    fn get_members(&self, ns: &str, group: &str) -> Result<HashSet<Vec<u8>>> {
        self.inner.get_members(ns, group)
    }

    fn is_member(&self, ns: &str, group: &str, member: &[u8]) -> Result<bool> {
        self.inner.is_member(ns, group, member)
    }

    fn group_size(&self, ns: &str, group: &str) -> Result<usize> {
        self.inner.group_size(ns, group)
    }

    fn set_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        data: &HashMap<String, Vec<u8>>,
    ) -> Result<()> {
        self.inner.set_and_publish(ns, channels_and_events, data)
    }

    fn set_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        old_data: &[u8],
        new_data: &[u8],
    ) -> Result<bool> {
        self.inner
            .set_if_and_publish(ns, channels_and_events, key, old_data, new_data)
    }

    fn set_if_not_exists_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        self.inner
            .set_if_not_exists_and_publish(ns, channels_and_events, key, data)
    }

    fn remove_and_publish(&self, ns: &str, channels_and_events: &ChannelsAndEvents, keys: &[String]) -> Result<()> {
        self.inner.remove_and_publish(ns, channels_and_events, keys)
    }

    fn remove_if_and_publish(
        &self,
        ns: &str,
        channels_and_events: &ChannelsAndEvents,
        key: &str,
        data: &[u8],
    ) -> Result<bool> {
        self.inner.remove_if_and_publish(ns, channels_and_events, key, data)
    }

    fn remove_all_and_publish(&self, ns: &str, channels_and_events: &ChannelsAndEvents) -> Result<()> {
        self.inner.remove_all_and_publish(ns, channels_and_events)
    }

    fn subscribe_channel(&self, ns: &str, callback: EventCallback, channels: &[String]) -> Result<()> {
        self.inner.subscribe_channel(ns, callback, channels)
    }

    fn unsubscribe_channel(&self, ns: &str, channels: &[String]) -> Result<()> {
        self.inner.unsubscribe_channel(ns, channels)
    }

    fn start_event_listener(&self) -> Result<()> {
        self.inner.start_event_listener()
    }

    fn handle_events(&self) -> Result<Option<Event>> {
        self.inner.handle_events()
    }

    fn lock_acquire(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool> {
        self.inner.lock_acquire(ns, name, token, expiration)
    }

    fn lock_release(&self, ns: &str, name: &str, token: &str) -> Result<bool> {
        if self.fail_next_release.swap(false, Ordering::SeqCst) {
            return Err(SdlError::NotConnected("connection reset".to_string()));
        }
        self.inner.lock_release(ns, name, token)
    }

    fn lock_refresh(&self, ns: &str, name: &str, token: &str, expiration: Duration) -> Result<bool> {
        self.inner.lock_refresh(ns, name, token, expiration)
    }

    fn lock_validity(&self, ns: &str, name: &str, token: &str) -> Result<Duration> {
        self.inner.lock_validity(ns, name, token)
    }

    fn lock_holder(&self, ns: &str, name: &str) -> Result<Option<String>> {
        self.inner.lock_holder(ns, name)
    }
}

// =============================================================================
// Acquire / Release Tests
// =============================================================================

#[test]
fn test_acquire_and_release() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();

    assert_eq!(lock.status().unwrap(), LockStatus::Unlocked);
    assert!(lock.acquire(SHORT_RETRY, Duration::from_millis(100)).unwrap());
    assert_eq!(lock.status().unwrap(), LockStatus::Locked);

    lock.release().unwrap();
    assert_eq!(lock.status().unwrap(), LockStatus::Unlocked);
}

#[test]
fn test_second_handle_cannot_acquire() {
    let sdl = setup_storage();
    let a = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    let b = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();

    assert!(a.acquire(SHORT_RETRY, Duration::from_millis(50)).unwrap());
    assert!(!b.acquire(SHORT_RETRY, Duration::from_millis(50)).unwrap());
    assert_eq!(b.status().unwrap(), LockStatus::LockedByOther);

    a.release().unwrap();
    assert!(b.acquire(SHORT_RETRY, Duration::from_millis(50)).unwrap());
}

#[test]
fn test_reacquire_by_holder_fails() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();

    assert!(lock.acquire(SHORT_RETRY, Duration::from_millis(50)).unwrap());
    assert!(!lock.acquire(SHORT_RETRY, Duration::from_millis(50)).unwrap());

    // still the holder after the failed attempt
    lock.release().unwrap();
}

#[test]
fn test_release_without_holding_is_rejected() {
    let sdl = setup_storage();
    let a = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    let b = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(a.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    assert!(matches!(b.release(), Err(SdlError::RejectedByBackend(_))));
    assert_eq!(a.status().unwrap(), LockStatus::Locked);
}

#[test]
fn test_concurrent_acquire_single_winner() {
    let sdl = setup_storage();
    let winners = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6)
        .map(|_| {
            let sdl = Arc::clone(&sdl);
            let winners = Arc::clone(&winners);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let lock = sdl
                    .get_lock_resource("ns", "shared", Duration::from_secs(10))
                    .unwrap();
                barrier.wait();
                if lock.acquire(SHORT_RETRY, Duration::from_millis(100)).unwrap() {
                    winners.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Validity / Refresh Tests
// =============================================================================

#[test]
fn test_validity_time_for_holder() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(lock.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    let validity = lock.get_validity_time().unwrap();

    assert!(validity <= Duration::from_secs(5));
    assert!(validity > Duration::from_secs(4));
}

#[test]
fn test_validity_time_for_non_holder_is_rejected() {
    let sdl = setup_storage();
    let a = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    let b = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(a.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    assert!(matches!(
        b.get_validity_time(),
        Err(SdlError::RejectedByBackend(_))
    ));
}

#[test]
fn test_lock_expires() {
    let sdl = setup_storage();
    let a = sdl.get_lock_resource("ns", "lock", Duration::from_millis(50)).unwrap();
    let b = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(a.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    thread::sleep(Duration::from_millis(120));

    assert_eq!(a.status().unwrap(), LockStatus::Unlocked);
    assert!(a.get_validity_time().is_err());
    assert!(b.acquire(SHORT_RETRY, Duration::ZERO).unwrap());
    assert!(a.release().is_err());
}

#[test]
fn test_refresh_extends_validity() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_millis(300)).unwrap();
    assert!(lock.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    thread::sleep(Duration::from_millis(150));
    lock.refresh().unwrap();

    assert!(lock.get_validity_time().unwrap() > Duration::from_millis(200));
}

#[test]
fn test_refresh_without_holding_is_rejected() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_secs(1)).unwrap();

    assert!(matches!(lock.refresh(), Err(SdlError::RejectedByBackend(_))));
}

// =============================================================================
// Retry / Misuse Tests
// =============================================================================

#[test]
fn test_acquire_gives_up_after_timeout() {
    let sdl = setup_storage();
    let a = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    let b = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(a.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    let started = Instant::now();
    assert!(!b.acquire(Duration::from_millis(20), Duration::from_millis(100)).unwrap());
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn test_acquire_succeeds_once_released_by_other_thread() {
    let sdl = setup_storage();
    let a = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(a.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    let waiter = {
        let sdl = Arc::clone(&sdl);
        thread::spawn(move || {
            let b = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
            b.acquire(SHORT_RETRY, Duration::from_secs(5)).unwrap()
        })
    };
    thread::sleep(Duration::from_millis(50));
    a.release().unwrap();

    assert!(waiter.join().unwrap());
}

#[test]
fn test_zero_expiration_is_misuse() {
    let sdl = setup_storage();

    assert!(matches!(
        sdl.get_lock_resource("ns", "lock", Duration::ZERO),
        Err(SdlError::Misuse(_))
    ));
}

#[test]
fn test_lock_key_visible_in_namespace() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "my_lock", Duration::from_secs(5)).unwrap();
    assert!(lock.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    assert_eq!(sdl.find_keys("ns", "my_*").unwrap(), vec!["my_lock"]);
    assert!(lock.to_string().contains("my_lock"));
}

#[test]
fn test_oversized_expiration_is_misuse() {
    let sdl = setup_storage();

    assert!(matches!(
        sdl.get_lock_resource("ns", "lock", Duration::MAX),
        Err(SdlError::Misuse(_))
    ));
    assert!(sdl
        .get_lock_resource("ns", "lock", SyncLock::MAX_EXPIRATION)
        .is_ok());
}

#[test]
fn test_unbounded_retry_timeout() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();

    assert!(lock.acquire(SHORT_RETRY, Duration::MAX).unwrap());
    assert_eq!(lock.status().unwrap(), LockStatus::Locked);
}

// =============================================================================
// Failure Recovery Tests
// =============================================================================

#[test]
fn test_release_retry_after_transient_failure() {
    let backend = Arc::new(FlakyReleaseBackend::default());
    let sdl = SyncStorage::with_backend(backend.clone());
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(lock.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    backend.fail_next_release.store(true, Ordering::SeqCst);
    assert!(matches!(lock.release(), Err(SdlError::NotConnected(_))));
    assert_eq!(lock.status().unwrap(), LockStatus::Locked);

    lock.release().unwrap();
    assert_eq!(lock.status().unwrap(), LockStatus::Unlocked);
}

#[test]
fn test_lock_unusable_after_storage_close() {
    let sdl = setup_storage();
    let lock = sdl.get_lock_resource("ns", "lock", Duration::from_secs(5)).unwrap();
    assert!(lock.acquire(SHORT_RETRY, Duration::ZERO).unwrap());

    sdl.close();

    assert!(matches!(lock.release(), Err(SdlError::NotConnected(_))));
    assert!(matches!(lock.refresh(), Err(SdlError::NotConnected(_))));
    assert!(matches!(lock.get_validity_time(), Err(SdlError::NotConnected(_))));
    assert!(matches!(
        lock.acquire(SHORT_RETRY, Duration::ZERO),
        Err(SdlError::NotConnected(_))
    ));
}
