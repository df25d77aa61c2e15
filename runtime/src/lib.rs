//! # Fetch Cache Runtime
//!
//! Request coordination on top of `fetch-cache-core`.
//!
//! ## Core Components
//!
//! - **`FetchClient`**: deduplicates concurrent requests by identity, writes
//!   settled outcomes to the store and notifies listeners
//! - **`Query`**: declarative fetch bound to one request at a time, with a
//!   bounded eviction stack of recently used keys
//! - **`Fetcher`**: imperative fetches and mutations
//! - **`CacheWatcher`**: live view of one cache entry
//! - **SSR**: render-and-drain loop for server rendering and cache capture
//! - **`ClientRegistry`**: mutations from outside a render tree
//!
//! ## Example
//!
//! ```
//! use fetch_cache_core::request::{Headers, RequestDescriptor};
//! use fetch_cache_core::result::FetchResult;
//! use fetch_cache_core::transport::dispatcher_fn;
//! use fetch_cache_runtime::{FetchClient, Query, QueryOptions};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let client = FetchClient::new(dispatcher_fn(|_: &RequestDescriptor| async {
//!     Ok(FetchResult::success(json!({ "foo": "bar" }), 200, Headers::new()))
//! }));
//!
//! let query = Query::new(client);
//! let first = query.request(&RequestDescriptor::get("/foo"), &QueryOptions::default(), None);
//! assert!(first.loading);
//!
//! let settled = query.settled().await;
//! assert_eq!(settled.data, Some(json!({ "foo": "bar" })));
//! # }
//! ```

/// Request coordinator
pub mod client;

/// Client configuration and cache policies
pub mod config;

/// Imperative fetches and mutations
pub mod fetcher;

/// Default `reqwest` transport
pub mod http;

/// Prometheus metrics for observability
pub mod metrics;

/// Declarative queries and the eviction stack
pub mod query;

/// Process-wide client registry
pub mod registry;

/// Server-side rendering
pub mod ssr;

/// Single-entry cache watchers
pub mod watch;

pub use client::{FetchClient, PendingResult};
pub use config::{CachePolicy, ClientConfig, ExecutionContext};
pub use fetcher::{Fetcher, FetcherState};
pub use http::{ReqwestFetch, default_dispatcher};
pub use query::{FetchMorePlan, Query, QueryOptions, QueryResult};
pub use registry::{CacheMutation, ClientRegistry, mutate_fetch_cache};
pub use ssr::{
    DrainPhase, MarkupRenderer, RenderContext, SsrContext, collect_cache_after_render,
    render_and_drain,
};
pub use watch::CacheWatcher;
