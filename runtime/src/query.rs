//! Per-consumer query state.
//!
//! A [`Query`] is what one UI component holds across renders: the key it is
//! showing, the request in flight for that key, the last result, and its own
//! eviction stack. Each [`Query::request`] call corresponds to one render.
//!
//! # Stale responses
//!
//! The query records `current_key` (what it is showing) and `pending_key`
//! (what it is waiting for). A response is applied only when it belongs to
//! both. A response for a key the query has since moved away from is dropped
//! without touching the result.
//!
//! # Eviction
//!
//! Every key change goes through the query's [`EvictionStack`]. A new frame
//! retains its key in the client's ledger; frames dropped off the bottom
//! release theirs, and the client evicts a key from the store once no frame
//! anywhere still tracks it.

use crate::client::{FetchClient, PendingResult};
use crate::ssr::SsrContext;
use fetch_cache_core::bus::{EventHandlers, Subscription};
use fetch_cache_core::identity::IdentityKey;
use fetch_cache_core::request::RequestDescriptor;
use fetch_cache_core::result::{FetchError, FetchResult};
use fetch_cache_core::stack::{EvictionStack, StackChange, StackFrame};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Options for [`Query::request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Take part in server rendering. When off, the request is not dispatched
    /// during a server render at all (it is not merely left unregistered)
    /// and the query renders as loading until rendered interactively.
    pub ssr: bool,
    /// Do not fetch; render an idle result.
    pub skip: bool,
    /// Stack size for this query; the client's default when unset.
    pub stack_size: Option<usize>,
    /// Explicit key, bypassing the identity function.
    pub key: Option<IdentityKey>,
}

impl QueryOptions {
    /// Set whether the query takes part in server rendering
    #[must_use]
    pub const fn with_ssr(mut self, ssr: bool) -> Self {
        self.ssr = ssr;
        self
    }

    /// Set whether the query is skipped
    #[must_use]
    pub const fn with_skip(mut self, skip: bool) -> Self {
        self.skip = skip;
        self
    }

    /// Set the stack size
    #[must_use]
    pub const fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = Some(stack_size);
        self
    }

    /// Use an explicit key
    #[must_use]
    pub fn with_key(mut self, key: IdentityKey) -> Self {
        self.key = Some(key);
        self
    }
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            ssr: true,
            skip: false,
            stack_size: None,
            key: None,
        }
    }
}

/// What a query renders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Payload, if loaded
    pub data: Option<Value>,
    /// Failure, if the last request failed
    pub error: Option<FetchError>,
    /// Whether a request is in flight
    pub loading: bool,
}

impl QueryResult {
    /// Result of a query waiting for its first response.
    #[must_use]
    pub const fn loading() -> Self {
        Self {
            data: None,
            error: None,
            loading: true,
        }
    }

    /// Result rendering a settled outcome.
    #[must_use]
    pub fn from_outcome(outcome: &FetchResult) -> Self {
        Self {
            data: outcome.data.clone(),
            error: outcome.error.clone(),
            loading: false,
        }
    }

    /// Deserialize the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if the payload does not match `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.data.clone().map(serde_json::from_value).transpose()
    }
}

/// Follow-up request chained to the current key.
pub struct FetchMorePlan {
    /// Request to perform
    pub descriptor: RequestDescriptor,
    /// Merge the follow-up payload (first) into the current payload (second)
    pub update_data: Box<dyn FnOnce(Value, Option<Value>) -> Value + Send>,
}

impl FetchMorePlan {
    /// Build a plan from a request and a merge function.
    pub fn new(
        descriptor: RequestDescriptor,
        update_data: impl FnOnce(Value, Option<Value>) -> Value + Send + 'static,
    ) -> Self {
        Self {
            descriptor,
            update_data: Box::new(update_data),
        }
    }
}

impl fmt::Debug for FetchMorePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchMorePlan")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct QueryState {
    stack: Option<EvictionStack>,
    current_key: Option<IdentityKey>,
    pending_key: Option<IdentityKey>,
    pending: Option<PendingResult>,
    loaded_key: Option<IdentityKey>,
    refetch: bool,
    result: QueryResult,
    subscription: Option<Subscription>,
}

impl QueryState {
    fn apply(&mut self, key: &IdentityKey, outcome: &FetchResult) -> bool {
        if self.current_key.as_ref() != Some(key) || self.pending_key.as_ref() != Some(key) {
            return false;
        }
        self.result = QueryResult::from_outcome(outcome);
        self.loaded_key = Some(key.clone());
        self.pending_key = None;
        self.pending = None;
        true
    }
}

/// Per-component query state machine.
///
/// # Example
///
/// ```
/// use fetch_cache_core::request::{Headers, RequestDescriptor};
/// use fetch_cache_core::result::FetchResult;
/// use fetch_cache_core::transport::dispatcher_fn;
/// use fetch_cache_runtime::{FetchClient, Query, QueryOptions};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let client = FetchClient::new(dispatcher_fn(|_: &RequestDescriptor| async {
///     Ok(FetchResult::success(json!(["a", "b"]), 200, Headers::new()))
/// }));
/// let query = Query::new(client);
///
/// let first = query.request(&RequestDescriptor::get("/items"), &QueryOptions::default(), None);
/// assert!(first.loading);
///
/// let settled = query.settled().await;
/// assert_eq!(settled.data, Some(json!(["a", "b"])));
/// # }
/// ```
pub struct Query {
    client: FetchClient,
    state: Arc<Mutex<QueryState>>,
}

impl Query {
    /// Query against `client`.
    #[must_use]
    pub fn new(client: FetchClient) -> Self {
        Self {
            client,
            state: Arc::new(Mutex::new(QueryState::default())),
        }
    }

    /// Render `request`.
    ///
    /// Switches the query to the request's key if it changed, then returns
    /// what to render: the result already loaded or loading for that key, a
    /// cached value, or a loading result after dispatching. When `ssr` is
    /// given, a dispatched request is registered with it.
    pub fn request(
        &self,
        request: &RequestDescriptor,
        options: &QueryOptions,
        ssr: Option<&SsrContext>,
    ) -> QueryResult {
        let key = options
            .key
            .clone()
            .unwrap_or_else(|| self.client.identity_of(request));

        let mut evicted = Vec::new();
        let result = {
            let mut state = self.state.lock();

            if state.current_key.as_ref() != Some(&key) {
                evicted = self.switch_key(&mut state, &key, options);
            }

            if options.skip {
                QueryResult::default()
            } else {
                self.resolve(&mut state, request, key, options, ssr)
            }
        };

        if !evicted.is_empty() {
            self.client.evict_frames(evicted);
        }
        result
    }

    fn switch_key(
        &self,
        state: &mut QueryState,
        key: &IdentityKey,
        options: &QueryOptions,
    ) -> Vec<StackFrame> {
        let default_size = self.client.default_stack_size();
        let stack = state
            .stack
            .get_or_insert_with(|| EvictionStack::new(options.stack_size.unwrap_or(default_size)));

        let evicted = match stack.activate(key.clone()) {
            StackChange::Pushed { evicted } => {
                self.client.retain_key(key);
                evicted
            },
            StackChange::Promoted | StackChange::Unchanged => Vec::new(),
        };

        if let Some(previous) = state.subscription.take() {
            previous.unsubscribe();
        }
        state.subscription = Some(self.subscribe(key.clone()));

        tracing::debug!(key = %key, evicted = evicted.len(), "Query switched key");

        state.current_key = Some(key.clone());
        state.pending_key = None;
        state.pending = None;
        state.loaded_key = None;
        state.refetch = false;
        evicted
    }

    fn subscribe(&self, key: IdentityKey) -> Subscription {
        let on_update = Arc::downgrade(&self.state);
        let on_revalidate = Arc::downgrade(&self.state);
        let update_key = key.clone();
        let revalidate_key = key.clone();

        self.client.listen(
            key,
            EventHandlers::new()
                .on_update(move |value| {
                    let Some(state) = on_update.upgrade() else {
                        return;
                    };
                    let mut state = state.lock();
                    if state.current_key.as_ref() != Some(&update_key) {
                        return;
                    }
                    if state.pending_key.as_ref() == Some(&update_key) {
                        state.apply(&update_key, value);
                    } else if state.loaded_key.as_ref() == Some(&update_key) {
                        state.result = QueryResult::from_outcome(value);
                    }
                })
                .on_revalidate(move || {
                    let Some(state) = on_revalidate.upgrade() else {
                        return;
                    };
                    let mut state = state.lock();
                    if state.current_key.as_ref() == Some(&revalidate_key) {
                        state.loaded_key = None;
                        state.refetch = true;
                    }
                }),
        )
    }

    fn resolve(
        &self,
        state: &mut QueryState,
        request: &RequestDescriptor,
        key: IdentityKey,
        options: &QueryOptions,
        ssr: Option<&SsrContext>,
    ) -> QueryResult {
        if state.loaded_key.as_ref() == Some(&key) || state.pending_key.as_ref() == Some(&key) {
            return state.result.clone();
        }

        if !state.refetch {
            if let Some(outcome) = self.client.get(&key) {
                state.result = QueryResult::from_outcome(&outcome);
                state.loaded_key = Some(key);
                return state.result.clone();
            }
        }

        if ssr.is_some() && !options.ssr {
            state.result = QueryResult::loading();
            return state.result.clone();
        }

        let pending = self.client.dispatch_with_key(request, key.clone());
        if let Some(ssr) = ssr {
            ssr.register(pending.clone());
        }

        state.refetch = false;
        state.pending_key = Some(key);
        state.pending = Some(pending);
        state.result = QueryResult {
            loading: true,
            ..state.result.clone()
        };
        if state.loaded_key.is_none() {
            state.result.data = None;
            state.result.error = None;
        }
        state.result.clone()
    }

    /// Wait for the request in flight, if any, and return the result.
    pub async fn settled(&self) -> QueryResult {
        let waiting = {
            let state = self.state.lock();
            state.pending_key.clone().zip(state.pending.clone())
        };

        if let Some((key, pending)) = waiting {
            let outcome = pending.await;
            // The update listener usually got there first
            self.state.lock().apply(&key, &outcome);
        }
        self.result()
    }

    /// Apply `outcome` for `key`.
    ///
    /// Applied only when `key` is both the key the query shows and the key it
    /// is waiting for; otherwise the outcome is stale and dropped. Returns
    /// whether it was applied.
    pub fn settle(&self, key: &IdentityKey, outcome: &FetchResult) -> bool {
        let applied = self.state.lock().apply(key, outcome);
        if !applied {
            tracing::debug!(key = %key, "Discarded response for inactive key");
        }
        applied
    }

    /// Chain a follow-up request to the current key.
    ///
    /// `make_plan` sees the current result and returns the follow-up, or `None` to
    /// do nothing. The follow-up key joins the current stack frame. Its
    /// payload is merged into the current data with the plan's merge
    /// function; a failure keeps the current data and sets the error. If the
    /// query switched keys before the follow-up settled, the response is
    /// dropped.
    ///
    /// `make_plan` runs while the query state is locked and must not call back
    /// into this query or write to the client.
    pub async fn fetch_more<P>(&self, make_plan: P) -> QueryResult
    where
        P: FnOnce(&QueryResult) -> Option<FetchMorePlan>,
    {
        let started = {
            let mut state = self.state.lock();
            let Some(primary) = state.current_key.clone() else {
                return state.result.clone();
            };
            let Some(plan) = make_plan(&state.result) else {
                return state.result.clone();
            };

            let key = self.client.identity_of(&plan.descriptor);
            if state
                .stack
                .as_mut()
                .is_some_and(|stack| stack.push_derived(key.clone()))
            {
                self.client.retain_key(&key);
            }

            state.result.loading = true;
            let pending = self.client.dispatch_with_key(&plan.descriptor, key);
            (primary, plan.update_data, pending)
        };

        let (primary, update_data, pending) = started;
        let outcome = pending.await;

        let mut state = self.state.lock();
        if state.current_key.as_ref() != Some(&primary) {
            tracing::debug!(key = %primary, "Discarded follow-up for inactive key");
            return state.result.clone();
        }

        state.result.loading = false;
        match outcome.error {
            Some(error) => state.result.error = Some(error),
            None => {
                let previous = state.result.data.take();
                let next = outcome.data.unwrap_or(Value::Null);
                state.result.data = Some(update_data(next, previous));
                state.result.error = None;
            },
        }
        state.result.clone()
    }

    /// The current result.
    #[must_use]
    pub fn result(&self) -> QueryResult {
        self.state.lock().result.clone()
    }

    /// The key the query shows.
    #[must_use]
    pub fn current_key(&self) -> Option<IdentityKey> {
        self.state.lock().current_key.clone()
    }

    /// The query's stack frames, oldest first.
    #[must_use]
    pub fn frames(&self) -> Vec<StackFrame> {
        self.state
            .lock()
            .stack
            .as_ref()
            .map(|stack| stack.frames().cloned().collect())
            .unwrap_or_default()
    }

    /// Tear the query down: stop listening and release every tracked key.
    pub fn unmount(&self) {
        let frames = {
            let mut state = self.state.lock();
            if let Some(subscription) = state.subscription.take() {
                subscription.unsubscribe();
            }
            state.current_key = None;
            state.pending_key = None;
            state.pending = None;
            state.loaded_key = None;
            state.stack.as_mut().map(EvictionStack::drain).unwrap_or_default()
        };
        self.client.evict_frames(frames);
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        if let Some(subscription) = self.state.lock().subscription.take() {
            subscription.unsubscribe();
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Query")
            .field("current_key", &state.current_key)
            .field("pending_key", &state.pending_key)
            .field("result", &state.result)
            .finish_non_exhaustive()
    }
}
