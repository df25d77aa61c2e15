//! Notification bus for cache value updates.
//!
//! Publish/subscribe keyed by identity key. Each [`NotificationBus::subscribe`]
//! call creates one registration and returns a [`Subscription`] handle that
//! removes exactly that registration, never its siblings on the same key.
//!
//! Events are typed ([`FetchEvent`]) rather than matched by event name. Every
//! published event is delivered to the registrations of its key in
//! registration order, then forwarded to a broadcast channel for observers that
//! want every event regardless of key (tests, devtools, logging).
//!
//! # Example
//!
//! ```
//! use fetch_cache_core::bus::{EventHandlers, FetchEvent, NotificationBus};
//! use fetch_cache_core::identity::IdentityKey;
//! use fetch_cache_core::result::FetchResult;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let bus = NotificationBus::new(16);
//! let seen = Arc::new(AtomicUsize::new(0));
//! let counter = Arc::clone(&seen);
//!
//! let key = IdentityKey::new("GET:/foo");
//! let subscription = bus.subscribe(
//!     key.clone(),
//!     EventHandlers::new().on_update(move |_| {
//!         counter.fetch_add(1, Ordering::SeqCst);
//!     }),
//! );
//!
//! bus.publish(FetchEvent::Update { key: key.clone(), value: FetchResult::default() });
//! subscription.unsubscribe();
//! bus.publish(FetchEvent::Update { key, value: FetchResult::default() });
//!
//! assert_eq!(seen.load(Ordering::SeqCst), 1);
//! ```

use crate::identity::IdentityKey;
use crate::result::FetchResult;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;

/// Event published on the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchEvent {
    /// A value was settled or written for `key`.
    Update {
        /// Affected key
        key: IdentityKey,
        /// The new value
        value: FetchResult,
    },
    /// Consumers of `key` should refetch.
    Revalidate {
        /// Affected key
        key: IdentityKey,
    },
}

impl FetchEvent {
    /// The key the event is addressed to.
    #[must_use]
    pub const fn key(&self) -> &IdentityKey {
        match self {
            Self::Update { key, .. } | Self::Revalidate { key } => key,
        }
    }
}

type UpdateHandler = Box<dyn Fn(&FetchResult) + Send + Sync>;
type RevalidateHandler = Box<dyn Fn() + Send + Sync>;

/// Handlers of one registration. Either may be absent.
#[derive(Default)]
pub struct EventHandlers {
    update: Option<UpdateHandler>,
    revalidate: Option<RevalidateHandler>,
}

impl EventHandlers {
    /// Registration with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle `Update` events.
    #[must_use]
    pub fn on_update(mut self, handler: impl Fn(&FetchResult) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(handler));
        self
    }

    /// Handle `Revalidate` events.
    #[must_use]
    pub fn on_revalidate(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.revalidate = Some(Box::new(handler));
        self
    }

    fn deliver(&self, event: &FetchEvent) {
        match event {
            FetchEvent::Update { value, .. } => {
                if let Some(handler) = &self.update {
                    handler(value);
                }
            },
            FetchEvent::Revalidate { .. } => {
                if let Some(handler) = &self.revalidate {
                    handler();
                }
            },
        }
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("update", &self.update.is_some())
            .field("revalidate", &self.revalidate.is_some())
            .finish()
    }
}

type Registrations = HashMap<IdentityKey, Vec<(u64, Arc<EventHandlers>)>>;

struct BusInner {
    registrations: RwLock<Registrations>,
    next_id: AtomicU64,
    sender: broadcast::Sender<FetchEvent>,
}

impl BusInner {
    fn remove(&self, key: &IdentityKey, id: u64) -> bool {
        let mut registrations = self.registrations.write();
        let Some(list) = registrations.get_mut(key) else {
            return false;
        };

        let before = list.len();
        list.retain(|(registered, _)| *registered != id);
        let removed = list.len() != before;

        if list.is_empty() {
            registrations.remove(key);
        }
        removed
    }
}

/// Key-addressed publish/subscribe channel.
///
/// Cloning is cheap and clones share registrations.
#[derive(Clone)]
pub struct NotificationBus {
    inner: Arc<BusInner>,
}

impl NotificationBus {
    /// Create a bus whose broadcast channel buffers `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                registrations: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                sender,
            }),
        }
    }

    /// Register `handlers` for events addressed to `key`.
    pub fn subscribe(&self, key: IdentityKey, handlers: EventHandlers) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .registrations
            .write()
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(handlers)));

        tracing::trace!(key = %key, id, "Listener registered");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            key,
            id,
        }
    }

    /// Deliver `event` to every registration of its key, in registration
    /// order, then forward it to broadcast observers.
    ///
    /// Handlers run after the registration lock is released, so a handler may
    /// subscribe or unsubscribe without deadlocking.
    pub fn publish(&self, event: FetchEvent) {
        let handlers: Vec<Arc<EventHandlers>> = self
            .inner
            .registrations
            .read()
            .get(event.key())
            .map(|list| list.iter().map(|(_, handlers)| Arc::clone(handlers)).collect())
            .unwrap_or_default();

        for handler in &handlers {
            handler.deliver(&event);
        }

        // No receivers is fine
        let _ = self.inner.sender.send(event);
    }

    /// Receiver of every event published from now on.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<FetchEvent> {
        self.inner.sender.subscribe()
    }

    /// Number of registrations for `key`.
    #[must_use]
    pub fn subscriber_count(&self, key: &IdentityKey) -> usize {
        self.inner
            .registrations
            .read()
            .get(key)
            .map_or(0, Vec::len)
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(64)
    }
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("keys", &self.inner.registrations.read().len())
            .finish_non_exhaustive()
    }
}

/// Handle to one registration.
///
/// Dropping the handle leaves the registration in place; call
/// [`Subscription::unsubscribe`] to remove it.
#[must_use = "dropping a Subscription does not unsubscribe; keep it to call unsubscribe()"]
#[derive(Debug, Clone)]
pub struct Subscription {
    bus: Weak<BusInner>,
    key: IdentityKey,
    id: u64,
}

impl Subscription {
    /// Remove this registration. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(&self.key, self.id) {
                tracing::trace!(key = %self.key, id = self.id, "Listener removed");
            }
        }
    }

    /// The key this registration listens on.
    #[must_use]
    pub const fn key(&self) -> &IdentityKey {
        &self.key
    }
}
