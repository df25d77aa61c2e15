//! Process-wide client registry for mutations from outside a render tree.
//!
//! Code that does not render (websocket handlers, background sync, command
//! palettes) has no provider scope to reach a client through. It goes through
//! a [`ClientRegistry`] instead: the interactive client registers itself once
//! at startup and unregisters at teardown.
//!
//! Server clients are per-request, so registering one in a process-wide slot
//! would leak one request's cache into another. The registry rejects them.

use crate::client::FetchClient;
use crate::config::ExecutionContext;
use fetch_cache_core::cache::CacheItem;
use fetch_cache_core::error::UsageError;
use fetch_cache_core::identity::IdentityKey;
use fetch_cache_core::result::{FetchResult, ResultPatch};
use parking_lot::RwLock;
use std::fmt;

static GLOBAL: ClientRegistry = ClientRegistry::new();

/// How to change a cache entry.
pub enum CacheMutation {
    /// Replace the entry outright.
    Replace(FetchResult),
    /// Shallow-merge the patch over the previous value.
    Merge(ResultPatch),
    /// Compute the replacement from the previous value.
    Update(Box<dyn FnOnce(Option<FetchResult>) -> FetchResult + Send>),
}

impl CacheMutation {
    /// Build a [`CacheMutation::Update`] from a closure.
    pub fn update(
        updater: impl FnOnce(Option<FetchResult>) -> FetchResult + Send + 'static,
    ) -> Self {
        Self::Update(Box::new(updater))
    }

    fn apply(self, previous: Option<FetchResult>) -> FetchResult {
        match self {
            Self::Replace(value) => value,
            Self::Merge(patch) => FetchResult::patched(previous, patch),
            Self::Update(updater) => updater(previous),
        }
    }
}

impl fmt::Debug for CacheMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace(value) => f.debug_tuple("Replace").field(value).finish(),
            Self::Merge(patch) => f.debug_tuple("Merge").field(patch).finish(),
            Self::Update(_) => f.write_str("Update(..)"),
        }
    }
}

/// Holder of at most one registered client.
#[derive(Default)]
pub struct ClientRegistry {
    slot: RwLock<Option<FetchClient>>,
}

impl ClientRegistry {
    /// Empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Register `client`, replacing any client registered before.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::RegisteredOnServer`] for server clients.
    pub fn register(&self, client: FetchClient) -> Result<(), UsageError> {
        if client.execution_context() == ExecutionContext::Server {
            tracing::warn!("Rejected server client registration");
            return Err(UsageError::RegisteredOnServer);
        }
        *self.slot.write() = Some(client);
        tracing::debug!("Client registered for local mutations");
        Ok(())
    }

    /// Remove the registered client, returning it.
    pub fn unregister(&self) -> Option<FetchClient> {
        self.slot.write().take()
    }

    /// The registered client.
    #[must_use]
    pub fn client(&self) -> Option<FetchClient> {
        self.slot.read().clone()
    }

    /// Apply `mutation` to the entry under `key` on the registered client and
    /// publish the result.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ClientNotRegistered`] when the registry is
    /// empty.
    pub fn mutate(
        &self,
        key: &IdentityKey,
        mutation: CacheMutation,
    ) -> Result<CacheItem, UsageError> {
        let client = self.client().ok_or(UsageError::ClientNotRegistered)?;
        Ok(client.update(key, |previous| mutation.apply(previous)))
    }
}

impl fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("registered", &self.slot.read().is_some())
            .finish()
    }
}

/// Mutate an entry through the global registry.
///
/// # Errors
///
/// Returns [`UsageError::ClientNotRegistered`] when no client is registered
/// globally.
pub fn mutate_fetch_cache(
    key: &IdentityKey,
    mutation: CacheMutation,
) -> Result<CacheItem, UsageError> {
    ClientRegistry::global().mutate(key, mutation)
}
