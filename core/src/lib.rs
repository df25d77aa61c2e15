//! # Fetch Cache Core
//!
//! Core traits and types for the fetch cache.
//!
//! This crate provides the leaf components of the request coordination core.
//! Everything here is synchronous and runtime-agnostic; the coordinator that
//! ties the pieces together lives in `fetch-cache-runtime`.
//!
//! ## Core Concepts
//!
//! - **Request Descriptor**: An immutable description of a request (method, URL, body)
//! - **Identity Key**: A deterministic string derived from a descriptor, the unit of
//!   deduplication and cache addressing
//! - **Result Store**: Key-addressed map of settled outcomes with snapshot/restore
//! - **Eviction Stack**: Bounded sequence of stack frames that evicts the oldest
//!   frame's keys from the store on overflow
//! - **Notification Bus**: Per-key publish/subscribe for value updates
//! - **Transport**: Injected capability that performs the actual request
//!
//! ## Example
//!
//! ```
//! use fetch_cache_core::request::RequestDescriptor;
//! use fetch_cache_core::identity::identity_of;
//!
//! let request = RequestDescriptor::get("/foo");
//! assert_eq!(identity_of(&request).as_str(), "GET:/foo");
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde_json::Value;

/// Notification bus for cache value updates
pub mod bus;

/// Result store and cache snapshots
pub mod cache;

/// Usage errors
pub mod error;

/// Identity keys derived from request descriptors
pub mod identity;

/// Request descriptors
pub mod request;

/// Settled request outcomes
pub mod result;

/// Eviction stack and the global key ledger
pub mod stack;

/// Transport capabilities consumed by the coordinator
pub mod transport;

/// Environment module - Dependency injection traits
///
/// External sources of non-determinism are abstracted behind traits so the
/// store can be driven by a fixed clock in tests.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```ignore
    /// // Test - fixed time for deterministic tests
    /// struct FixedClock { time: DateTime<Utc> }
    /// impl Clock for FixedClock {
    ///     fn now(&self) -> DateTime<Utc> {
    ///         self.time
    ///     }
    /// }
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use bus::{EventHandlers, FetchEvent, NotificationBus, Subscription};
pub use cache::{CacheItem, CacheSnapshot, CacheState, FetchCache, LocalCache};
pub use error::UsageError;
pub use identity::{IdentityFn, IdentityKey, identity_of};
pub use request::{Headers, Method, RequestBody, RequestDescriptor};
pub use result::{FetchError, FetchResult, ResultPatch};
pub use stack::{DEFAULT_STACK_SIZE, EvictionStack, KeyLedger, StackChange, StackFrame};
pub use transport::{
    Dispatcher, FnDispatcher, HttpDispatcher, HttpFetch, RawResponse, dispatcher_fn,
};

#[cfg(test)]
mod tests {
    use super::environment::{Clock, SystemClock};

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
