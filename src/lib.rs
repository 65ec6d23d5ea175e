//! # sdlkv
//!
//! A shared, namespaced key-value data layer client with:
//! - Atomic compare-and-swap and compare-and-delete
//! - Group (set) membership
//! - Write+publish combinators that notify only when the write took effect
//! - Channel subscriptions with managed or polled delivery
//! - Distributed locks with expiring holder tokens
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │            SyncStorage  /  SyncLock  /  TypedStorage         │
//! │        (validation, normalization, deterministic order)      │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  Arc<dyn DbBackend>
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌──────────────────┐
//!   │  In-Memory  │          │      Redis       │
//!   │  (Mutex)    │          │ crc32(ns) % n    │
//!   └──────┬──────┘          └────────┬─────────┘
//!          │                          │ pool · scripts · pub/sub
//!          ▼                          ▼
//!   ┌─────────────────────────────────────────────┐
//!   │   EventDispatcher (one per connection)       │
//!   │   managed thread  │  handle_events() poll    │
//!   └─────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod keyspace;
pub mod glob;
pub mod backend;
pub mod events;
pub mod lock;
pub mod storage;
pub mod typed;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{Result, SdlError};
pub use config::{BackendType, Config, Endpoint};
pub use events::{Event, EventCallback};
pub use keyspace::{ChannelsAndEvents, EVENT_SEPARATOR};
pub use lock::{LockStatus, SyncLock};
pub use storage::SyncStorage;
pub use typed::TypedStorage;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of sdlkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
