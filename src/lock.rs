//! Lock Module
//!
//! Named mutual-exclusion primitive scoped to a namespace.
//!
//! ## Responsibilities
//! - Acquire a lock key with bounded retries
//! - Release and refresh only while this handle's token still holds the key
//! - Read the remaining validity in one atomic holder-check-and-read step
//!
//! ## States
//! ```text
//!   Unlocked ──acquire()──▶ Locked(token) ──release()──▶ Unlocked
//!                                │
//!                                └──(expiration lapses)──▶ Unlocked
//! ```
//! A handle never holds the lock on its own: `acquire` must be called. The
//! backend, not the client, guarantees that one token at most holds a name.
//! Handles stop working once the storage that issued them is closed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::backend::DbBackend;
use crate::error::{Result, SdlError};

/// Lock state as seen from one handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    /// Nobody holds the lock
    Unlocked,

    /// This handle holds the lock
    Locked,

    /// Another handle holds the lock
    LockedByOther,
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockStatus::Unlocked => write!(f, "Unlocked"),
            LockStatus::Locked => write!(f, "Locked"),
            LockStatus::LockedByOther => write!(f, "Locked by someone else"),
        }
    }
}

/// Handle to a named lock
///
/// ## Concurrency
/// The handle may be shared between threads; the holder token sits behind a
/// `parking_lot::Mutex`. Two handles on the same `(namespace, name)` compete
/// through the backend.
pub struct SyncLock {
    ns: String,
    name: String,
    expiration: Duration,
    backend: Arc<dyn DbBackend>,

    /// Closed flag of the issuing storage
    closed: Arc<AtomicBool>,

    /// Token stored under the lock key while this handle holds it
    token: Mutex<Option<String>>,
}

impl SyncLock {
    // =========================================================================
    // Acquire Defaults
    // =========================================================================
    pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);
    pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

    /// Longest expiration a lock may carry (100 years)
    pub const MAX_EXPIRATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

    pub(crate) fn new(
        backend: Arc<dyn DbBackend>,
        closed: Arc<AtomicBool>,
        ns: &str,
        name: &str,
        expiration: Duration,
    ) -> Result<Self> {
        if expiration.is_zero() || expiration > Self::MAX_EXPIRATION {
            return Err(SdlError::Misuse(format!(
                "lock '{}' needs an expiration between 1 ms and {:?}, got {:?}",
                name,
                Self::MAX_EXPIRATION,
                expiration
            )));
        }
        Ok(Self {
            ns: ns.to_string(),
            name: name.to_string(),
            expiration,
            backend,
            closed,
            token: Mutex::new(None),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Try to take the lock, retrying every `retry_interval` until
    /// `retry_timeout` has elapsed
    ///
    /// At least one attempt is made. Returns whether the lock was taken. A
    /// handle that already holds the lock does not take it again. A timeout
    /// too large for the clock retries without a deadline.
    pub fn acquire(&self, retry_interval: Duration, retry_timeout: Duration) -> Result<bool> {
        if retry_interval.is_zero() {
            return Err(SdlError::Misuse("lock retry interval must be non-zero".to_string()));
        }

        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now().checked_add(retry_timeout);
        let mut attempts = 0u64;

        loop {
            self.ensure_open()?;
            attempts += 1;
            if self.backend.lock_acquire(&self.ns, &self.name, &token, self.expiration)? {
                tracing::debug!(ns = %self.ns, lock = %self.name, attempts, "lock acquired");
                *self.token.lock() = Some(token);
                return Ok(true);
            }

            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::debug!(ns = %self.ns, lock = %self.name, attempts, "lock acquire timed out");
                        return Ok(false);
                    }
                    retry_interval.min(deadline - now)
                }
                None => retry_interval,
            };
            thread::sleep(pause);
        }
    }

    /// `acquire` with a 100 ms retry interval and a 10 s timeout
    pub fn acquire_default(&self) -> Result<bool> {
        self.acquire(Self::DEFAULT_RETRY_INTERVAL, Self::DEFAULT_RETRY_TIMEOUT)
    }

    /// Release the lock if this handle still holds it
    ///
    /// Fails with a rejection when the handle never acquired the lock or when
    /// the lock lapsed and was possibly taken by someone else. The token is
    /// kept when the backend call itself fails, so the release can be retried.
    pub fn release(&self) -> Result<()> {
        let token = self.current_token()?;
        let released = self.backend.lock_release(&self.ns, &self.name, &token)?;
        self.forget(&token);
        if !released {
            return Err(self.not_owned());
        }
        tracing::debug!(ns = %self.ns, lock = %self.name, "lock released");
        Ok(())
    }

    /// Reset the expiration to its original duration while still held
    pub fn refresh(&self) -> Result<()> {
        let token = self.current_token()?;
        if !self
            .backend
            .lock_refresh(&self.ns, &self.name, &token, self.expiration)?
        {
            self.forget(&token);
            return Err(self.not_owned());
        }
        Ok(())
    }

    /// Remaining time before the lock lapses; a rejection if not the holder
    pub fn get_validity_time(&self) -> Result<Duration> {
        let token = self.current_token()?;
        self.backend.lock_validity(&self.ns, &self.name, &token)
    }

    /// Current state of the lock relative to this handle
    pub fn status(&self) -> Result<LockStatus> {
        self.ensure_open()?;
        let holder = self.backend.lock_holder(&self.ns, &self.name)?;
        let own = self.token.lock();
        Ok(match holder {
            None => LockStatus::Unlocked,
            Some(token) if own.as_deref() == Some(token.as_str()) => LockStatus::Locked,
            Some(_) => LockStatus::LockedByOther,
        })
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn current_token(&self) -> Result<String> {
        self.ensure_open()?;
        self.token.lock().clone().ok_or_else(|| self.not_owned())
    }

    /// Drop the stored token unless a concurrent acquire replaced it
    fn forget(&self, token: &str) {
        let mut own = self.token.lock();
        if own.as_deref() == Some(token) {
            *own = None;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SdlError::NotConnected("storage is closed".to_string()));
        }
        Ok(())
    }

    fn not_owned(&self) -> SdlError {
        SdlError::RejectedByBackend(format!(
            "lock '{}' in namespace '{}' is not owned by this handle",
            self.name, self.ns
        ))
    }
}

impl fmt::Display for SyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.status() {
            Ok(status) => status.to_string(),
            Err(_) => "Unknown".to_string(),
        };
        write!(
            f,
            "lock namespace={} name={} expiration={:?} status={}",
            self.ns, self.name, self.expiration, status
        )
    }
}

impl fmt::Debug for SyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncLock")
            .field("ns", &self.ns)
            .field("name", &self.name)
            .field("expiration", &self.expiration)
            .field("held", &self.token.lock().is_some())
            .finish()
    }
}
