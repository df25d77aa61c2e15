//! Request coordinator.
//!
//! [`FetchClient`] deduplicates in-flight requests by identity key, writes
//! settled outcomes to the result store according to the cache policy, and
//! publishes every settle and every explicit write on the notification bus.
//!
//! # Dispatch lifecycle
//!
//! ```text
//! dispatch(request)
//!   │
//!   ├─ key in flight? ──yes──▶ clone of the existing PendingResult
//!   │
//!   └─ no: build a shared future, register it under key
//!            │ (first poll)
//!            ▼
//!        transport ──▶ outcome (transport failure → error outcome)
//!            │
//!            ▼
//!        settle: remove in-flight entry
//!                write store entry if the policy approves
//!                publish Update { key, value }
//!            │
//!            ▼
//!        every clone resolves with the same outcome
//! ```
//!
//! The transport starts as soon as the request is registered: the shared
//! future is spawned on the current Tokio runtime, so dropping every handle
//! does not cancel the request. Outside a runtime nothing drives it until a
//! clone is polled.
//!
//! A key released by its last eviction-stack frame while still in flight is
//! remembered, and its outcome is not written to the store when it settles.

use crate::config::{CachePolicy, ClientConfig, ExecutionContext};
use crate::metrics::{CacheMetrics, CoordinatorMetrics};
use fetch_cache_core::bus::{EventHandlers, FetchEvent, NotificationBus, Subscription};
use fetch_cache_core::cache::{CacheItem, CacheSnapshot, FetchCache, LocalCache};
use fetch_cache_core::identity::{IdentityFn, IdentityKey, identity_of};
use fetch_cache_core::request::{Headers, RequestDescriptor};
use fetch_cache_core::result::FetchResult;
use fetch_cache_core::stack::{KeyLedger, StackFrame};
use fetch_cache_core::transport::Dispatcher;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::broadcast;

/// Cloneable handle to an in-flight request's outcome.
///
/// Every clone resolves with the same settled value.
pub type PendingResult = Shared<BoxFuture<'static, FetchResult>>;

struct ClientInner {
    cache: Arc<dyn FetchCache>,
    dispatcher: Arc<dyn Dispatcher>,
    identity: Option<IdentityFn>,
    policy: CachePolicy,
    default_headers: Headers,
    execution: ExecutionContext,
    default_stack_size: usize,
    bus: NotificationBus,
    in_flight: Mutex<HashMap<IdentityKey, PendingResult>>,
    // Locked after `in_flight`, never before
    released_in_flight: Mutex<HashSet<IdentityKey>>,
    ledger: Mutex<KeyLedger>,
}

impl ClientInner {
    fn settle(
        &self,
        key: &IdentityKey,
        request: &RequestDescriptor,
        outcome: &FetchResult,
        started: Instant,
    ) {
        let approved = self.policy.should_cache(request, outcome);

        // Written under the in-flight lock; `release_key` checks under it too
        let (remaining, cached) = {
            let mut in_flight = self.in_flight.lock();
            in_flight.remove(key);
            let released = self.released_in_flight.lock().remove(key)
                && !self.ledger.lock().contains(key);

            let cached = approved && !released;
            if cached {
                self.cache.set(key, outcome.clone());
            } else if released {
                tracing::debug!(key = %key, "Skipped store write for evicted key");
            }
            (in_flight.len(), cached)
        };
        CoordinatorMetrics::record_in_flight(remaining);
        CoordinatorMetrics::record_settle(outcome.is_error(), started.elapsed());

        if cached {
            CacheMetrics::record_write();
            tracing::debug!(key = %key, is_error = outcome.is_error(), "Settled and cached");
        } else {
            tracing::debug!(key = %key, is_error = outcome.is_error(), "Settled without caching");
        }

        self.bus.publish(FetchEvent::Update {
            key: key.clone(),
            value: outcome.clone(),
        });
    }
}

/// The request coordinator.
///
/// Cloning is cheap; clones share the store, in-flight map and bus.
///
/// # Example
///
/// ```
/// use fetch_cache_core::request::{Headers, RequestDescriptor};
/// use fetch_cache_core::result::FetchResult;
/// use fetch_cache_core::transport::dispatcher_fn;
/// use fetch_cache_runtime::FetchClient;
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = FetchClient::new(dispatcher_fn(|_: &RequestDescriptor| async {
///     Ok(FetchResult::success(json!({ "foo": "bar" }), 200, Headers::new()))
/// }));
///
/// let outcome = client.dispatch(&RequestDescriptor::get("/foo")).await;
/// assert_eq!(outcome.data, Some(json!({ "foo": "bar" })));
/// assert!(client.get(&"GET:/foo".into()).is_some());
/// # }
/// ```
#[derive(Clone)]
pub struct FetchClient {
    inner: Arc<ClientInner>,
}

impl FetchClient {
    /// Client with the default configuration and an in-memory store.
    pub fn new(dispatcher: impl Dispatcher + 'static) -> Self {
        Self::with_config(dispatcher, ClientConfig::default())
    }

    /// Client with `config` and an in-memory store.
    pub fn with_config(dispatcher: impl Dispatcher + 'static, config: ClientConfig) -> Self {
        Self::with_cache(Arc::new(dispatcher), Arc::new(LocalCache::new()), config)
    }

    /// Client over an explicit dispatcher and store.
    ///
    /// If the config carries an initial snapshot it replaces the store's
    /// contents.
    #[must_use]
    pub fn with_cache(
        dispatcher: Arc<dyn Dispatcher>,
        cache: Arc<dyn FetchCache>,
        config: ClientConfig,
    ) -> Self {
        let ClientConfig {
            cache_policy,
            default_headers,
            execution,
            initial_state,
            default_stack_size,
            event_capacity,
            identity,
        } = config;

        let ledger = match initial_state {
            Some(snapshot) => {
                tracing::debug!(entries = snapshot.entries.len(), "Hydrating client from snapshot");
                cache.set_state(snapshot.entries);
                KeyLedger::restored(snapshot.stack)
            },
            None => KeyLedger::new(),
        };

        Self {
            inner: Arc::new(ClientInner {
                cache,
                dispatcher,
                identity,
                policy: cache_policy,
                default_headers,
                execution,
                default_stack_size,
                bus: NotificationBus::new(event_capacity),
                in_flight: Mutex::new(HashMap::new()),
                released_in_flight: Mutex::new(HashSet::new()),
                ledger: Mutex::new(ledger),
            }),
        }
    }

    /// Identity key of `request` under this client's identity function.
    #[must_use]
    pub fn identity_of(&self, request: &RequestDescriptor) -> IdentityKey {
        match &self.inner.identity {
            Some(identity) => identity(request),
            None => identity_of(request),
        }
    }

    /// Dispatch `request` under its identity key.
    ///
    /// See [`FetchClient::dispatch_with_key`].
    pub fn dispatch(&self, request: &RequestDescriptor) -> PendingResult {
        let key = self.identity_of(request);
        self.dispatch_with_key(request, key)
    }

    /// Dispatch `request` under an explicit key.
    ///
    /// If `key` is already in flight, returns a clone of that pending result
    /// and the transport is not invoked again. Otherwise registers a new
    /// pending result under `key` and spawns it on the current Tokio runtime.
    /// The check and the registration happen under one lock.
    #[tracing::instrument(skip_all, fields(key = %key), name = "fetch_dispatch")]
    pub fn dispatch_with_key(
        &self,
        request: &RequestDescriptor,
        key: IdentityKey,
    ) -> PendingResult {
        let mut in_flight = self.inner.in_flight.lock();

        if let Some(pending) = in_flight.get(&key) {
            CoordinatorMetrics::record_dispatch(true);
            tracing::debug!("Joined in-flight request");
            return pending.clone();
        }

        let request = request.with_default_headers(&self.inner.default_headers);
        let dispatcher = Arc::clone(&self.inner.dispatcher);
        let client: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let settle_key = key.clone();

        let pending = async move {
            let started = Instant::now();
            let outcome = match dispatcher.dispatch(&request).await {
                Ok(outcome) => outcome,
                Err(error) => {
                    tracing::warn!(key = %settle_key, error = %error, "Transport failed");
                    FetchResult::failure(error)
                },
            };

            if let Some(client) = client.upgrade() {
                client.settle(&settle_key, &request, &outcome, started);
            }
            outcome
        }
        .boxed()
        .shared();

        in_flight.insert(key, pending.clone());
        CoordinatorMetrics::record_dispatch(false);
        CoordinatorMetrics::record_in_flight(in_flight.len());
        drop(in_flight);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(pending.clone());
                tracing::debug!("Registered and started in-flight request");
            },
            Err(_) => tracing::debug!("Registered in-flight request outside a runtime"),
        }

        pending
    }

    /// Cached outcome for `key`.
    #[must_use]
    pub fn get(&self, key: &IdentityKey) -> Option<FetchResult> {
        self.inner.cache.get(key).map(|item| item.value)
    }

    /// Cached entry for `key`, with its timestamp.
    #[must_use]
    pub fn get_item(&self, key: &IdentityKey) -> Option<CacheItem> {
        self.inner.cache.get(key)
    }

    /// Write `value` under `key` and publish an update.
    pub fn set(&self, key: &IdentityKey, value: FetchResult) -> CacheItem {
        let item = self.inner.cache.set(key, value);
        CacheMetrics::record_write();
        self.inner.bus.publish(FetchEvent::Update {
            key: key.clone(),
            value: item.value.clone(),
        });
        item
    }

    /// Replace the value under `key` with `updater(previous)` and publish an
    /// update.
    ///
    /// The updater returns the full replacement; nothing is merged here.
    pub fn update<F>(&self, key: &IdentityKey, updater: F) -> CacheItem
    where
        F: FnOnce(Option<FetchResult>) -> FetchResult,
    {
        let previous = self.get(key);
        self.set(key, updater(previous))
    }

    /// Delete the entry for `key` without publishing.
    pub fn remove(&self, key: &IdentityKey) -> Option<CacheItem> {
        self.inner.cache.remove(key)
    }

    /// Register handlers for events on `key`.
    pub fn listen(&self, key: IdentityKey, handlers: EventHandlers) -> Subscription {
        self.inner.bus.subscribe(key, handlers)
    }

    /// Receiver of every event this client publishes from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<FetchEvent> {
        self.inner.bus.events()
    }

    /// Ask consumers of `key` to refetch.
    pub fn revalidate(&self, key: &IdentityKey) {
        self.inner
            .bus
            .publish(FetchEvent::Revalidate { key: key.clone() });
    }

    /// Number of listeners registered for `key`.
    #[must_use]
    pub fn listener_count(&self, key: &IdentityKey) -> usize {
        self.inner.bus.subscriber_count(key)
    }

    /// Pending result for `key`, if in flight.
    #[must_use]
    pub fn in_flight(&self, key: &IdentityKey) -> Option<PendingResult> {
        self.inner.in_flight.lock().get(key).cloned()
    }

    /// Whether `key` is in flight.
    #[must_use]
    pub fn is_in_flight(&self, key: &IdentityKey) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    /// Snapshot of every pending result.
    #[must_use]
    pub fn pending(&self) -> Vec<PendingResult> {
        self.inner.in_flight.lock().values().cloned().collect()
    }

    /// Number of requests in flight.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Wait for every request in flight at call time to settle.
    ///
    /// The snapshot is taken when this method is called, not when the
    /// returned future is first polled; requests dispatched in between are
    /// not waited on.
    pub fn wait_for_pending(&self) -> impl Future<Output = ()> + Send + 'static {
        let pending = self.pending();
        async move {
            if pending.is_empty() {
                return;
            }
            tracing::debug!(count = pending.len(), "Waiting for pending requests");
            join_all(pending).await;
        }
    }

    /// Capture the store and the tracked-key ledger.
    #[must_use]
    pub fn get_state(&self) -> CacheSnapshot {
        CacheSnapshot {
            entries: self.inner.cache.get_state(),
            stack: self.inner.ledger.lock().keys(),
        }
    }

    /// Replace the store and the ledger with `snapshot`.
    ///
    /// Restored ledger entries are unclaimed until a query retains them.
    pub fn set_state(&self, snapshot: CacheSnapshot) {
        self.inner.cache.set_state(snapshot.entries);
        *self.inner.ledger.lock() = KeyLedger::restored(snapshot.stack);
    }

    /// Where the client runs.
    #[must_use]
    pub fn execution_context(&self) -> ExecutionContext {
        self.inner.execution
    }

    /// Stack size for queries that do not pick one.
    #[must_use]
    pub fn default_stack_size(&self) -> usize {
        self.inner.default_stack_size
    }

    /// Keys currently tracked by eviction stacks, oldest first.
    #[must_use]
    pub fn tracked_keys(&self) -> Vec<IdentityKey> {
        self.inner.ledger.lock().keys()
    }

    /// Record that a stack frame tracks `key`.
    pub fn retain_key(&self, key: &IdentityKey) {
        self.inner.ledger.lock().retain(key);
    }

    /// Record that a stack frame stopped tracking `key`.
    ///
    /// Removes the store entry once no frame tracks the key. A key still in
    /// flight is marked instead, and its outcome is not stored when it
    /// settles unless a frame tracks it again by then. Returns whether an
    /// entry was evicted.
    pub fn release_key(&self, key: &IdentityKey) -> bool {
        if !self.inner.ledger.lock().release(key) {
            return false;
        }

        let in_flight = self.inner.in_flight.lock();
        if in_flight.contains_key(key) {
            self.inner.released_in_flight.lock().insert(key.clone());
            tracing::debug!(key = %key, "Released while in flight");
            return false;
        }

        let evicted = self.inner.cache.remove(key).is_some();
        drop(in_flight);
        if evicted {
            tracing::debug!(key = %key, "Evicted from store");
        }
        evicted
    }

    /// Release every key of the given frames. Returns how many store entries
    /// were evicted.
    pub fn evict_frames(&self, frames: Vec<StackFrame>) -> usize {
        let evicted = frames
            .into_iter()
            .flat_map(StackFrame::into_keys)
            .filter(|key| self.release_key(key))
            .count();

        if evicted > 0 {
            CacheMetrics::record_evictions(evicted);
        }
        evicted
    }
}

impl fmt::Debug for FetchClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchClient")
            .field("policy", &self.inner.policy)
            .field("execution", &self.inner.execution)
            .field("in_flight", &self.pending_count())
            .finish_non_exhaustive()
    }
}
