//! Server-side render drain loop.
//!
//! A server render is synchronous, but the queries inside it start
//! asynchronous fetches. The drain loop closes that gap:
//!
//! ```text
//!          ┌──────────────────────────────────────────┐
//!          ▼                                          │
//!     Rendering ──(pending registered)──▶ Draining ───┘
//!          │                              await all, clear
//!    (nothing registered)
//!          ▼
//!     Done(markup)
//! ```
//!
//! Each pass renders against a [`RenderContext`] carrying an [`SsrContext`].
//! A query with no cached value dispatches, registers the pending result
//! with the context and renders its loading state. The loop then awaits
//! everything registered and renders again; the settled outcomes are now in
//! the store, so the next pass renders them synchronously.
//!
//! Failed fetches settle like any other outcome, so the loop never sees an
//! error. Under the default cache policy an error outcome is cached and the
//! next pass renders it.
//!
//! # Known risk
//!
//! There is no iteration cap. A query that registers a new request on every
//! pass (for example a key derived from the current time, or an error outcome
//! under a policy that does not cache errors) keeps the loop running forever.
//! That is a bug in the caller.

use crate::client::FetchClient;
use crate::metrics::SsrMetrics;
use crate::query::{QueryOptions, QueryResult};
use fetch_cache_core::cache::CacheSnapshot;
use fetch_cache_core::error::UsageError;
use fetch_cache_core::request::RequestDescriptor;
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// State of the drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    /// Rendering the tree
    Rendering,
    /// Awaiting requests registered by the last pass
    Draining,
    /// A pass registered nothing; its markup is final
    Done,
}

impl fmt::Display for DrainPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rendering => f.write_str("rendering"),
            Self::Draining => f.write_str("draining"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// Registration set for requests started during one render pass.
///
/// Cloning shares the set.
#[derive(Clone, Default)]
pub struct SsrContext {
    pending: Arc<Mutex<Vec<BoxFuture<'static, ()>>>>,
}

impl SsrContext {
    /// Empty registration set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request. Its output is discarded.
    pub fn register<F>(&self, pending: F)
    where
        F: Future + Send + 'static,
    {
        self.pending.lock().push(pending.map(|_| ()).boxed());
    }

    /// Whether anything was registered since the last drain.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.lock().is_empty()
    }

    /// Number of registrations since the last drain.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Take every registration, await them all and return how many there
    /// were.
    pub async fn consume_and_await(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let count = pending.len();
        join_all(pending).await;
        count
    }
}

impl fmt::Debug for SsrContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsrContext")
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// What a component can reach while rendering.
///
/// Stands in for the provider scope of a UI framework: the client is
/// optional so that reading it outside a provider is a reportable usage
/// error rather than a panic.
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    client: Option<FetchClient>,
    ssr: Option<SsrContext>,
}

impl RenderContext {
    /// Context providing `client`.
    #[must_use]
    pub const fn new(client: FetchClient) -> Self {
        Self {
            client: Some(client),
            ssr: None,
        }
    }

    /// Context with no client.
    #[must_use]
    pub const fn detached() -> Self {
        Self {
            client: None,
            ssr: None,
        }
    }

    /// Attach a registration set for server rendering.
    #[must_use]
    pub fn with_ssr(mut self, ssr: SsrContext) -> Self {
        self.ssr = Some(ssr);
        self
    }

    /// The provided client.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::MissingProvider`] when no client was provided.
    pub fn client(&self) -> Result<&FetchClient, UsageError> {
        self.client.as_ref().ok_or(UsageError::MissingProvider)
    }

    /// The registration set, when rendering on the server.
    #[must_use]
    pub const fn ssr(&self) -> Option<&SsrContext> {
        self.ssr.as_ref()
    }

    /// One-shot fetch for a single render pass.
    ///
    /// Serves a cached value synchronously. Otherwise starts the request and
    /// returns a loading result; a later pass reads the value from the store
    /// once it settles. On the server the pending result is also registered
    /// with the registration set. Stack tracking is left to long-lived
    /// [`Query`](crate::Query) instances.
    ///
    /// A query with `options.ssr` off is not dispatched at all during a
    /// server render, rather than dispatched and left unregistered. It
    /// renders as loading and is fetched once rendered interactively.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::MissingProvider`] when no client was provided.
    pub fn use_fetch(
        &self,
        request: &RequestDescriptor,
        options: &QueryOptions,
    ) -> Result<QueryResult, UsageError> {
        let client = self.client()?;

        if options.skip {
            return Ok(QueryResult::default());
        }

        let key = options
            .key
            .clone()
            .unwrap_or_else(|| client.identity_of(request));

        if let Some(outcome) = client.get(&key) {
            return Ok(QueryResult::from_outcome(&outcome));
        }

        match &self.ssr {
            Some(_) if !options.ssr => {},
            Some(ssr) => ssr.register(client.dispatch_with_key(request, key)),
            None => drop(client.dispatch_with_key(request, key)),
        }

        Ok(QueryResult::loading())
    }
}

type BeforeRender = Box<dyn FnMut(&FetchClient) + Send>;

/// Drain loop bound to a client, with a hook run before every pass.
pub struct MarkupRenderer {
    client: FetchClient,
    on_before_render: Option<BeforeRender>,
}

impl MarkupRenderer {
    /// Renderer for `client`.
    #[must_use]
    pub fn new(client: FetchClient) -> Self {
        Self {
            client,
            on_before_render: None,
        }
    }

    /// Run `hook` before every render pass.
    #[must_use]
    pub fn on_before_render(mut self, hook: impl FnMut(&FetchClient) + Send + 'static) -> Self {
        self.on_before_render = Some(Box::new(hook));
        self
    }

    /// The client queries render against.
    #[must_use]
    pub const fn client(&self) -> &FetchClient {
        &self.client
    }

    /// Render `tree` until a pass registers no requests.
    pub async fn render<T, F>(&mut self, tree: &T, mut render: F) -> String
    where
        T: ?Sized,
        F: FnMut(&T, &RenderContext) -> String,
    {
        let ssr = SsrContext::new();
        let context = RenderContext::new(self.client.clone()).with_ssr(ssr.clone());
        let client = &self.client;
        let hook = &mut self.on_before_render;

        drain(&ssr, || {
            if let Some(hook) = hook.as_mut() {
                hook(client);
            }
            render(tree, &context)
        })
        .await
    }
}

impl fmt::Debug for MarkupRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarkupRenderer")
            .field("client", &self.client)
            .field("on_before_render", &self.on_before_render.is_some())
            .finish()
    }
}

/// Render `tree` with a fresh registration set until a pass registers no
/// requests, and return that pass's markup.
///
/// # Example
///
/// ```
/// use fetch_cache_runtime::ssr::render_and_drain;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let markup = render_and_drain(&"static", |tree, _ssr| format!("<p>{tree}</p>")).await;
/// assert_eq!(markup, "<p>static</p>");
/// # }
/// ```
pub async fn render_and_drain<T, F>(tree: &T, mut render: F) -> String
where
    T: ?Sized,
    F: FnMut(&T, &SsrContext) -> String,
{
    let ssr = SsrContext::new();
    drain(&ssr, || render(tree, &ssr)).await
}

async fn drain(ssr: &SsrContext, mut pass: impl FnMut() -> String) -> String {
    let mut passes = 0usize;
    loop {
        passes += 1;
        tracing::trace!(phase = %DrainPhase::Rendering, pass = passes);
        let markup = pass();
        SsrMetrics::record_pass();

        if !ssr.has_pending() {
            tracing::trace!(phase = %DrainPhase::Done, pass = passes);
            tracing::info!(passes, "Server render converged");
            return markup;
        }

        tracing::trace!(phase = %DrainPhase::Draining, pending = ssr.pending_count());
        let drained = ssr.consume_and_await().await;
        SsrMetrics::record_drained(drained);
        tracing::debug!(drained, pass = passes, "Drained pending requests");
    }
}

/// Render `tree` once, wait for every request it started, and capture the
/// client's cache.
///
/// Only requests started by that single pass are awaited; requests that
/// depend on their results are not discovered. Use [`render_and_drain`] or
/// [`MarkupRenderer`] when the tree has dependent fetches.
pub async fn collect_cache_after_render<T, F>(
    client: &FetchClient,
    tree: &T,
    render: F,
) -> CacheSnapshot
where
    T: ?Sized,
    F: FnOnce(&T, &RenderContext) -> String,
{
    let context = RenderContext::new(client.clone());
    let _markup = render(tree, &context);
    client.wait_for_pending().await;
    client.get_state()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_consume_clears_registrations() {
        let ssr = SsrContext::new();
        ssr.register(async { 1 });
        ssr.register(async {});
        assert_eq!(ssr.pending_count(), 2);

        assert_eq!(ssr.consume_and_await().await, 2);
        assert!(!ssr.has_pending());
    }

    #[tokio::test]
    async fn test_loop_reruns_until_quiet() {
        let passes = AtomicUsize::new(0);

        let markup = render_and_drain(&(), |_, ssr| {
            let pass = passes.fetch_add(1, Ordering::SeqCst) + 1;
            if pass < 3 {
                ssr.register(async {});
            }
            format!("pass {pass}")
        })
        .await;

        assert_eq!(markup, "pass 3");
        assert_eq!(passes.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_detached_context_reports_missing_provider() {
        let context = RenderContext::detached();
        assert_eq!(context.client().err(), Some(UsageError::MissingProvider));
        assert_eq!(
            context
                .use_fetch(&RequestDescriptor::get("/foo"), &QueryOptions::default())
                .err(),
            Some(UsageError::MissingProvider)
        );
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(DrainPhase::Draining.to_string(), "draining");
    }
}
