//! Imperative fetches and mutations.
//!
//! A [`Fetcher`] turns an argument into a request with its action creator and
//! dispatches it on demand, tracking the last action, its outcome and whether
//! it is still loading. Requests go through the coordinator, so concurrent
//! identical fetches are still deduplicated and `GET` outcomes are cached
//! under the default policy; writes are not.

use crate::client::FetchClient;
use fetch_cache_core::request::RequestDescriptor;
use fetch_cache_core::result::{FetchError, FetchResult};
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;

type ActionCreator<A> = Box<dyn Fn(A) -> Option<RequestDescriptor> + Send + Sync>;

/// Snapshot of a fetcher.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetcherState {
    /// Outcome of the last completed action
    pub value: Option<FetchResult>,
    /// The last action started
    pub action: Option<RequestDescriptor>,
    /// Whether the last action is in flight
    pub loading: bool,
}

impl FetcherState {
    /// Payload of the last outcome.
    #[must_use]
    pub fn data(&self) -> Option<&Value> {
        self.value.as_ref().and_then(|value| value.data.as_ref())
    }

    /// Error of the last outcome.
    #[must_use]
    pub fn error(&self) -> Option<&FetchError> {
        self.value.as_ref().and_then(|value| value.error.as_ref())
    }
}

/// On-demand fetcher.
///
/// # Example
///
/// ```
/// use fetch_cache_core::request::{Headers, RequestBody, RequestDescriptor};
/// use fetch_cache_core::result::FetchResult;
/// use fetch_cache_core::transport::dispatcher_fn;
/// use fetch_cache_runtime::{FetchClient, Fetcher};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = FetchClient::new(dispatcher_fn(|_: &RequestDescriptor| async {
///     Ok(FetchResult::success(json!({ "saved": true }), 201, Headers::new()))
/// }));
///
/// let save = Fetcher::new(client, |title: &'static str| {
///     Some(RequestDescriptor::post("/todos").with_body(RequestBody::form([("title", title)])))
/// });
///
/// let data = save.mutate("write docs").await;
/// assert_eq!(data.ok().flatten(), Some(json!({ "saved": true })));
/// # }
/// ```
pub struct Fetcher<A> {
    client: FetchClient,
    creator: ActionCreator<A>,
    state: Mutex<FetcherState>,
}

impl<A> Fetcher<A> {
    /// Fetcher building its requests with `creator`. A creator returning
    /// `None` turns the call into a no-op.
    pub fn new(
        client: FetchClient,
        creator: impl Fn(A) -> Option<RequestDescriptor> + Send + Sync + 'static,
    ) -> Self {
        Self {
            client,
            creator: Box::new(creator),
            state: Mutex::new(FetcherState::default()),
        }
    }

    /// Build the action for `arg` and dispatch it.
    ///
    /// Returns `Ok(None)` without dispatching when the creator returns
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns the outcome's [`FetchError`] when the request failed. The
    /// failed outcome is still recorded in [`Fetcher::state`].
    pub async fn fetch(&self, arg: A) -> Result<Option<Value>, FetchError> {
        let Some(action) = (self.creator)(arg) else {
            return Ok(None);
        };

        *self.state.lock() = FetcherState {
            value: None,
            action: Some(action.clone()),
            loading: true,
        };

        let outcome = self.client.dispatch(&action).await;

        *self.state.lock() = FetcherState {
            value: Some(outcome.clone()),
            action: Some(action),
            loading: false,
        };

        outcome.into_outcome()
    }

    /// Alias of [`Fetcher::fetch`] for write requests.
    ///
    /// # Errors
    ///
    /// Returns the outcome's [`FetchError`] when the request failed.
    pub async fn mutate(&self, arg: A) -> Result<Option<Value>, FetchError> {
        self.fetch(arg).await
    }

    /// Clear the recorded state.
    pub fn reset(&self) {
        *self.state.lock() = FetcherState::default();
    }

    /// Snapshot of the recorded state.
    #[must_use]
    pub fn state(&self) -> FetcherState {
        self.state.lock().clone()
    }
}

impl<A> fmt::Debug for Fetcher<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fetcher")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
