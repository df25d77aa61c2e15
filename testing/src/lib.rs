//! # Fetch Cache Testing
//!
//! Testing utilities for the fetch cache.
//!
//! This crate provides:
//! - Scripted transports ([`MockDispatcher`], [`MockHttpFetch`])
//! - A deterministic clock for cache timestamps
//! - proptest strategies for requests and keys
//! - Tracing setup for tests
//!
//! ## Example
//!
//! ```
//! use fetch_cache_core::request::RequestDescriptor;
//! use fetch_cache_core::transport::Dispatcher;
//! use fetch_cache_testing::MockDispatcher;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let dispatcher = MockDispatcher::new().ok_json("/foo", json!({ "foo": "bar" }));
//!
//! let outcome = dispatcher.dispatch(&RequestDescriptor::get("/foo")).await;
//!
//! assert_eq!(outcome.ok().and_then(|o| o.data), Some(json!({ "foo": "bar" })));
//! assert_eq!(dispatcher.call_count(), 1);
//! # }
//! ```

use chrono::{DateTime, Utc};
use fetch_cache_core::environment::Clock;

/// Mock implementations for testing.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use fetch_cache_core::request::{Headers, RequestDescriptor};
    use fetch_cache_core::result::{FetchError, FetchResult};
    use fetch_cache_core::transport::{Dispatcher, HttpFetch, RawResponse};
    use futures::FutureExt;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use fetch_cache_testing::mocks::FixedClock;
    /// use fetch_cache_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    type Reply = Result<FetchResult, FetchError>;

    enum Script {
        Ready(Reply),
        Deferred(Option<oneshot::Receiver<Reply>>),
    }

    #[derive(Default)]
    struct Scripts {
        by_url: Mutex<HashMap<String, Script>>,
        calls: Mutex<Vec<RequestDescriptor>>,
    }

    /// Scripted [`Dispatcher`] keyed by request URL.
    ///
    /// Every call is recorded when the coordinator invokes the dispatcher,
    /// which happens when the spawned pending result first runs. URLs with
    /// no script fail with a transport error.
    ///
    /// Clones share scripts and the call log.
    #[derive(Clone, Default)]
    pub struct MockDispatcher {
        scripts: Arc<Scripts>,
    }

    impl MockDispatcher {
        /// Dispatcher with no scripts.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer every request for `url` with `reply`.
        #[must_use]
        pub fn respond(
            self,
            url: impl Into<String>,
            reply: Result<FetchResult, FetchError>,
        ) -> Self {
            self.scripts.by_url.lock().insert(url.into(), Script::Ready(reply));
            self
        }

        /// Answer `url` with `data`, status 200 and no headers.
        #[must_use]
        pub fn ok_json(self, url: impl Into<String>, data: Value) -> Self {
            self.respond(url, Ok(FetchResult::success(data, 200, Headers::new())))
        }

        /// Fail `url` at the transport level with `message`.
        #[must_use]
        pub fn fail(self, url: impl Into<String>, message: impl Into<String>) -> Self {
            self.respond(url, Err(FetchError::transport(message)))
        }

        /// Hold the next request for `url` until the returned sender fires.
        ///
        /// Dropping the sender fails the request with a transport error.
        #[must_use]
        pub fn defer(
            &self,
            url: impl Into<String>,
        ) -> oneshot::Sender<Result<FetchResult, FetchError>> {
            let (sender, receiver) = oneshot::channel();
            self.scripts
                .by_url
                .lock()
                .insert(url.into(), Script::Deferred(Some(receiver)));
            sender
        }

        /// Number of dispatches so far.
        #[must_use]
        pub fn call_count(&self) -> usize {
            self.scripts.calls.lock().len()
        }

        /// Requests dispatched for `url`, oldest first.
        #[must_use]
        pub fn calls_for(&self, url: &str) -> Vec<RequestDescriptor> {
            self.scripts
                .calls
                .lock()
                .iter()
                .filter(|call| call.url() == url)
                .cloned()
                .collect()
        }
    }

    impl Dispatcher for MockDispatcher {
        fn dispatch(
            &self,
            request: &RequestDescriptor,
        ) -> BoxFuture<'static, Result<FetchResult, FetchError>> {
            self.scripts.calls.lock().push(request.clone());
            let url = request.url().to_string();

            let mut scripts = self.scripts.by_url.lock();
            match scripts.get_mut(&url) {
                Some(Script::Ready(reply)) => futures::future::ready(reply.clone()).boxed(),
                Some(Script::Deferred(receiver)) => match receiver.take() {
                    Some(receiver) => async move {
                        receiver.await.unwrap_or_else(|_| {
                            Err(FetchError::transport(format!("Request for {url} was cancelled")))
                        })
                    }
                    .boxed(),
                    None => unscripted(url),
                },
                None => unscripted(url),
            }
        }
    }

    fn unscripted<T: Send + 'static>(url: String) -> BoxFuture<'static, Result<T, FetchError>> {
        futures::future::ready(Err(FetchError::transport(format!("Failed to fetch {url}")))).boxed()
    }

    impl std::fmt::Debug for MockDispatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockDispatcher")
                .field("calls", &self.call_count())
                .finish_non_exhaustive()
        }
    }

    /// Scripted [`HttpFetch`] returning raw responses keyed by URL.
    #[derive(Debug, Clone, Default)]
    pub struct MockHttpFetch {
        responses: Arc<Mutex<HashMap<String, RawResponse>>>,
    }

    impl MockHttpFetch {
        /// Fetch with no responses.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer `url` with `response`.
        #[must_use]
        pub fn with_response(self, url: impl Into<String>, response: RawResponse) -> Self {
            self.responses.lock().insert(url.into(), response);
            self
        }
    }

    impl HttpFetch for MockHttpFetch {
        fn fetch(
            &self,
            request: &RequestDescriptor,
        ) -> BoxFuture<'static, Result<RawResponse, FetchError>> {
            let url = request.url().to_string();
            match self.responses.lock().get(&url).cloned() {
                Some(response) => futures::future::ready(Ok(response)).boxed(),
                None => unscripted(url),
            }
        }
    }
}

/// Test helpers and utilities.
pub mod helpers {
    use tracing_subscriber::EnvFilter;

    /// Install a test-friendly tracing subscriber.
    ///
    /// Honors `RUST_LOG`. Safe to call from every test; only the first call
    /// installs anything.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use fetch_cache_core::identity::IdentityKey;
    use fetch_cache_core::request::RequestDescriptor;
    use proptest::prelude::*;

    /// Relative request paths such as `/a/b3`.
    pub fn arb_path() -> impl Strategy<Value = String> {
        prop::collection::vec("[a-z][a-z0-9]{0,5}", 1..4)
            .prop_map(|parts| format!("/{}", parts.join("/")))
    }

    /// `GET` requests for [`arb_path`] paths.
    pub fn arb_get() -> impl Strategy<Value = RequestDescriptor> {
        arb_path().prop_map(RequestDescriptor::get)
    }

    /// Keys in the default `GET:<url>` shape.
    pub fn arb_key() -> impl Strategy<Value = IdentityKey> {
        arb_path().prop_map(|path| IdentityKey::new(format!("GET:{path}")))
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, MockDispatcher, MockHttpFetch, test_clock};

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use fetch_cache_core::request::RequestDescriptor;
    use fetch_cache_core::result::FetchResult;
    use fetch_cache_core::transport::Dispatcher;
    use serde_json::json;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[tokio::test]
    async fn test_unscripted_url_fails() {
        let dispatcher = MockDispatcher::new();
        let error = dispatcher
            .dispatch(&RequestDescriptor::get("/nowhere"))
            .await
            .unwrap_err();
        assert_eq!(error.message(), "Failed to fetch /nowhere");
        assert_eq!(dispatcher.calls_for("/nowhere").len(), 1);
    }

    #[tokio::test]
    async fn test_deferred_reply_waits_for_sender() {
        let dispatcher = MockDispatcher::new();
        let release = dispatcher.defer("/slow");

        let pending = dispatcher.dispatch(&RequestDescriptor::get("/slow"));
        release.send(Ok(FetchResult::default())).unwrap();

        assert_eq!(pending.await.unwrap(), FetchResult::default());
    }

    #[tokio::test]
    async fn test_dropped_sender_cancels() {
        let dispatcher = MockDispatcher::new();
        drop(dispatcher.defer("/slow"));

        let error = dispatcher
            .dispatch(&RequestDescriptor::get("/slow"))
            .await
            .unwrap_err();
        assert!(error.message().contains("cancelled"));
    }

    #[tokio::test]
    async fn test_clones_share_call_log() {
        let dispatcher = MockDispatcher::new().ok_json("/foo", json!(1));
        let clone = dispatcher.clone();

        clone.dispatch(&RequestDescriptor::get("/foo")).await.unwrap();

        assert_eq!(dispatcher.call_count(), 1);
    }
}
