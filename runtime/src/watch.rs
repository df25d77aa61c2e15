//! Subscriptions to a single cache entry.

use crate::client::FetchClient;
use fetch_cache_core::bus::{EventHandlers, Subscription};
use fetch_cache_core::cache::CacheItem;
use fetch_cache_core::identity::IdentityKey;
use fetch_cache_core::result::{FetchResult, ResultPatch};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

struct WatchState {
    value: Mutex<Option<FetchResult>>,
    changed: Notify,
}

/// Live view of one cache entry.
///
/// Starts from the entry's current value and follows every update published
/// for its key. Dropping the watcher removes its own listener and no other.
pub struct CacheWatcher {
    client: FetchClient,
    key: IdentityKey,
    shared: Arc<WatchState>,
    subscription: Subscription,
}

impl CacheWatcher {
    /// Watch `key` on `client`.
    #[must_use]
    pub fn new(client: FetchClient, key: IdentityKey) -> Self {
        let shared = Arc::new(WatchState {
            value: Mutex::new(client.get(&key)),
            changed: Notify::new(),
        });

        let sink = Arc::downgrade(&shared);
        let subscription = client.listen(
            key.clone(),
            EventHandlers::new().on_update(move |value| {
                if let Some(shared) = sink.upgrade() {
                    *shared.value.lock() = Some(value.clone());
                    shared.changed.notify_waiters();
                }
            }),
        );

        Self {
            client,
            key,
            shared,
            subscription,
        }
    }

    /// The watched key.
    #[must_use]
    pub const fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// The latest value.
    #[must_use]
    pub fn value(&self) -> Option<FetchResult> {
        self.shared.value.lock().clone()
    }

    /// Wait for the next update and return it.
    pub async fn changed(&self) -> Option<FetchResult> {
        self.shared.changed.notified().await;
        self.value()
    }

    /// Shallow-merge `patch` over the cached value and publish the result.
    pub fn update(&self, patch: ResultPatch) -> CacheItem {
        self.client
            .update(&self.key, |previous| FetchResult::patched(previous, patch))
    }
}

impl Drop for CacheWatcher {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
    }
}

impl std::fmt::Debug for CacheWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheWatcher")
            .field("key", &self.key)
            .field("value", &*self.shared.value.lock())
            .finish_non_exhaustive()
    }
}
