//! Transport capabilities consumed by the coordinator.
//!
//! The coordinator never performs I/O itself. It is handed a [`Dispatcher`]
//! that turns a descriptor into a settled [`FetchResult`]. Most callers build
//! one from a lower-level [`HttpFetch`] with [`HttpDispatcher`], which decodes
//! the JSON body and maps failures onto the outcome shapes:
//!
//! - decodable body: `data`, `status` and `headers` set
//! - malformed body: `Decode` error with `status` and `headers` preserved
//! - transport failure: `Err(FetchError::Transport)`, which the coordinator
//!   folds into an error-tagged outcome
//!
//! Both traits return boxed futures so they stay dyn-compatible and can be
//! stored as `Arc<dyn Dispatcher>`.

use crate::request::{Headers, RequestDescriptor};
use crate::result::{FetchError, FetchResult};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Performs a request and resolves it into a settled outcome.
///
/// Implementations resolve with `Ok` for every response, including decode
/// failures, and reserve `Err` for transport-level failures where no response
/// was received.
pub trait Dispatcher: Send + Sync {
    /// Perform `request`.
    ///
    /// The returned future must not borrow `self` or `request`; clone what it
    /// needs up front.
    fn dispatch(&self, request: &RequestDescriptor)
    -> BoxFuture<'static, Result<FetchResult, FetchError>>;
}

impl<D: Dispatcher + ?Sized> Dispatcher for Arc<D> {
    fn dispatch(
        &self,
        request: &RequestDescriptor,
    ) -> BoxFuture<'static, Result<FetchResult, FetchError>> {
        (**self).dispatch(request)
    }
}

/// [`Dispatcher`] backed by a closure. Built with [`dispatcher_fn`].
pub struct FnDispatcher<F> {
    f: F,
}

impl<F> fmt::Debug for FnDispatcher<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDispatcher").finish_non_exhaustive()
    }
}

impl<F, Fut> Dispatcher for FnDispatcher<F>
where
    F: Fn(&RequestDescriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchResult, FetchError>> + Send + 'static,
{
    fn dispatch(
        &self,
        request: &RequestDescriptor,
    ) -> BoxFuture<'static, Result<FetchResult, FetchError>> {
        (self.f)(request).boxed()
    }
}

/// Wrap a closure as a [`Dispatcher`].
///
/// # Examples
///
/// ```
/// use fetch_cache_core::request::{Headers, RequestDescriptor};
/// use fetch_cache_core::result::FetchResult;
/// use fetch_cache_core::transport::{Dispatcher, dispatcher_fn};
///
/// let dispatcher = dispatcher_fn(|request: &RequestDescriptor| {
///     let url = request.url().to_string();
///     async move { Ok(FetchResult::success(url.into(), 200, Headers::new())) }
/// });
///
/// let outcome = futures::executor::block_on(dispatcher.dispatch(&RequestDescriptor::get("/foo")));
/// assert_eq!(outcome.ok().and_then(|r| r.data), Some("/foo".into()));
/// ```
pub const fn dispatcher_fn<F, Fut>(f: F) -> FnDispatcher<F>
where
    F: Fn(&RequestDescriptor) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchResult, FetchError>> + Send + 'static,
{
    FnDispatcher { f }
}

/// Raw response handed back by an [`HttpFetch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: Headers,
    /// Undecoded body
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Response with no headers.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: body.into(),
        }
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Decode the body as JSON.
    ///
    /// A `204 No Content` status or an empty body decodes to `null`.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Decode`] if the body is not valid JSON.
    pub fn json(&self) -> Result<Value, FetchError> {
        if self.status == 204 || self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&self.body)
            .map_err(|e| FetchError::decode(format!("Error parsing json: {e}")))
    }
}

/// Low-level HTTP capability: perform a request, return the raw response.
pub trait HttpFetch: Send + Sync {
    /// Perform `request`.
    ///
    /// # Errors
    ///
    /// The future resolves to [`FetchError::Transport`] when no response was
    /// received.
    fn fetch(&self, request: &RequestDescriptor)
    -> BoxFuture<'static, Result<RawResponse, FetchError>>;
}

/// Adapts an [`HttpFetch`] into a [`Dispatcher`] by decoding JSON bodies.
#[derive(Debug, Clone)]
pub struct HttpDispatcher<H> {
    fetch: H,
}

impl<H: HttpFetch> HttpDispatcher<H> {
    /// Wrap `fetch`.
    pub const fn new(fetch: H) -> Self {
        Self { fetch }
    }

    /// The wrapped fetch capability.
    pub const fn inner(&self) -> &H {
        &self.fetch
    }
}

impl<H: HttpFetch> Dispatcher for HttpDispatcher<H> {
    fn dispatch(
        &self,
        request: &RequestDescriptor,
    ) -> BoxFuture<'static, Result<FetchResult, FetchError>> {
        let response = self.fetch.fetch(request);
        async move {
            let raw = response.await?;
            let outcome = match raw.json() {
                Ok(data) => FetchResult::success(data, raw.status, raw.headers),
                Err(error) => {
                    tracing::debug!(
                        status = raw.status,
                        error = %error,
                        "Response body not decodable"
                    );
                    FetchResult::undecodable(error, raw.status, raw.headers)
                },
            };
            Ok(outcome)
        }
        .boxed()
    }
}
