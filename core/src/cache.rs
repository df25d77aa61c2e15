//! Result store.
//!
//! The store is a plain key-addressed map of settled outcomes, each stamped
//! with the time it was cached. It supports point reads and writes plus a
//! whole-state snapshot/restore used to hydrate a client from state captured
//! during server rendering.
//!
//! # Snapshot format
//!
//! ```json
//! {
//!   "entries": {
//!     "GET:/foo": {
//!       "id": "GET:/foo",
//!       "value": { "data": { "foo": "bar" }, "status": 200, "headers": {} },
//!       "cachedAt": "2025-01-01T00:00:00Z"
//!     }
//!   },
//!   "stack": ["GET:/foo"]
//! }
//! ```

use crate::environment::{Clock, SystemClock};
use crate::identity::IdentityKey;
use crate::result::FetchResult;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A cached outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheItem {
    /// Key the outcome is stored under
    pub id: IdentityKey,
    /// The outcome itself
    pub value: FetchResult,
    /// When the outcome was written
    pub cached_at: DateTime<Utc>,
}

/// Full contents of a result store.
pub type CacheState = BTreeMap<IdentityKey, CacheItem>;

/// Serializable snapshot of a client's cache.
///
/// `entries` is the result store; `stack` is the ordered list of keys tracked
/// by eviction stacks at the time of capture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Result store contents
    #[serde(default)]
    pub entries: CacheState,
    /// Stack-tracked keys, oldest first
    #[serde(default)]
    pub stack: Vec<IdentityKey>,
}

impl CacheSnapshot {
    /// Snapshot with entries and no tracked keys.
    #[must_use]
    pub const fn from_entries(entries: CacheState) -> Self {
        Self {
            entries,
            stack: Vec::new(),
        }
    }

    /// Whether the snapshot holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.stack.is_empty()
    }
}

/// Result store interface.
///
/// Methods take `&self`; implementations synchronize internally so the store
/// can be shared by the coordinator and every query built on top of it.
pub trait FetchCache: Send + Sync {
    /// Read an entry.
    fn get(&self, key: &IdentityKey) -> Option<CacheItem>;

    /// Write an entry, stamping it with the current time.
    fn set(&self, key: &IdentityKey, value: FetchResult) -> CacheItem;

    /// Delete an entry, returning it if present.
    fn remove(&self, key: &IdentityKey) -> Option<CacheItem>;

    /// Copy of the whole store.
    fn get_state(&self) -> CacheState;

    /// Replace the whole store atomically.
    fn set_state(&self, state: CacheState);
}

/// In-memory result store.
pub struct LocalCache {
    state: RwLock<CacheState>,
    clock: Arc<dyn Clock>,
}

impl LocalCache {
    /// Empty store using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping entries with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(CacheState::new()),
            clock,
        }
    }

    /// Store pre-populated with `state`.
    #[must_use]
    pub fn with_state(self, state: CacheState) -> Self {
        *self.state.write() = state;
        self
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }
}

impl Default for LocalCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

impl FetchCache for LocalCache {
    fn get(&self, key: &IdentityKey) -> Option<CacheItem> {
        self.state.read().get(key).cloned()
    }

    fn set(&self, key: &IdentityKey, value: FetchResult) -> CacheItem {
        let item = CacheItem {
            id: key.clone(),
            value,
            cached_at: self.clock.now(),
        };
        self.state.write().insert(key.clone(), item.clone());
        item
    }

    fn remove(&self, key: &IdentityKey) -> Option<CacheItem> {
        self.state.write().remove(key)
    }

    fn get_state(&self) -> CacheState {
        self.state.read().clone()
    }

    fn set_state(&self, state: CacheState) {
        *self.state.write() = state;
    }
}
