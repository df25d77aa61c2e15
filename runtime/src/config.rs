//! Client configuration.

use fetch_cache_core::cache::CacheSnapshot;
use fetch_cache_core::identity::{IdentityFn, IdentityKey};
use fetch_cache_core::request::{Headers, Method, RequestDescriptor};
use fetch_cache_core::result::FetchResult;
use fetch_cache_core::stack::DEFAULT_STACK_SIZE;
use std::fmt;
use std::sync::Arc;

/// Predicate deciding whether a settled outcome is written to the store.
pub type CachePredicate = Arc<dyn Fn(&RequestDescriptor, &FetchResult) -> bool + Send + Sync>;

/// Which settled outcomes the coordinator writes to the result store.
#[derive(Clone, Default)]
pub enum CachePolicy {
    /// Every settled `GET` outcome, error outcomes included.
    ///
    /// A failed read is cached like a successful one, so a server render that
    /// hit a failing endpoint still converges and the error hydrates to the
    /// client.
    #[default]
    Reads,
    /// Only `GET` outcomes that carry no error.
    ReadsSuccessOnly,
    /// Every settled outcome regardless of method.
    Always,
    /// Nothing; the store is only written through explicit `set`.
    Never,
    /// Caller-supplied predicate.
    Custom(CachePredicate),
}

impl CachePolicy {
    /// Build a [`CachePolicy::Custom`] from a closure.
    pub fn custom(
        predicate: impl Fn(&RequestDescriptor, &FetchResult) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// Whether `outcome` of `request` should be cached.
    #[must_use]
    pub fn should_cache(&self, request: &RequestDescriptor, outcome: &FetchResult) -> bool {
        match self {
            Self::Reads => request.method() == Method::Get,
            Self::ReadsSuccessOnly => request.method() == Method::Get && !outcome.is_error(),
            Self::Always => true,
            Self::Never => false,
            Self::Custom(predicate) => predicate(request, outcome),
        }
    }
}

impl fmt::Debug for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reads => f.write_str("Reads"),
            Self::ReadsSuccessOnly => f.write_str("ReadsSuccessOnly"),
            Self::Always => f.write_str("Always"),
            Self::Never => f.write_str("Never"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Where a client runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionContext {
    /// A long-lived interactive client (browser, desktop app, CLI session)
    #[default]
    Interactive,
    /// A per-request client used for server rendering
    Server,
}

impl ExecutionContext {
    /// Check if this is a server context
    #[must_use]
    pub const fn is_server(self) -> bool {
        matches!(self, Self::Server)
    }
}

/// Configuration for a [`FetchClient`](crate::FetchClient).
///
/// # Example
///
/// ```
/// use fetch_cache_runtime::config::{CachePolicy, ClientConfig, ExecutionContext};
///
/// let config = ClientConfig::default()
///     .with_cache_policy(CachePolicy::ReadsSuccessOnly)
///     .with_default_header("authorization", "Bearer token")
///     .with_execution(ExecutionContext::Server)
///     .with_default_stack_size(5);
///
/// assert_eq!(config.default_stack_size, 5);
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Which settled outcomes are cached
    pub cache_policy: CachePolicy,
    /// Headers merged into every dispatched request; request headers win
    pub default_headers: Headers,
    /// Where the client runs
    pub execution: ExecutionContext,
    /// Snapshot to hydrate from
    pub initial_state: Option<CacheSnapshot>,
    /// Stack size for queries that do not pick one
    pub default_stack_size: usize,
    /// Buffer size of the broadcast channel behind `events()`
    pub event_capacity: usize,
    /// Replacement for the default identity function
    pub identity: Option<IdentityFn>,
}

impl ClientConfig {
    /// Set the cache policy
    #[must_use]
    pub fn with_cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Replace the default headers
    #[must_use]
    pub fn with_default_headers(mut self, headers: Headers) -> Self {
        self.default_headers = headers;
        self
    }

    /// Add one default header
    #[must_use]
    pub fn with_default_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.default_headers.insert(name.into(), value.into());
        self
    }

    /// Set the execution context
    #[must_use]
    pub const fn with_execution(mut self, execution: ExecutionContext) -> Self {
        self.execution = execution;
        self
    }

    /// Hydrate from a snapshot captured elsewhere
    #[must_use]
    pub fn with_initial_state(mut self, snapshot: CacheSnapshot) -> Self {
        self.initial_state = Some(snapshot);
        self
    }

    /// Set the stack size used by queries that do not pick one
    #[must_use]
    pub const fn with_default_stack_size(mut self, stack_size: usize) -> Self {
        self.default_stack_size = stack_size;
        self
    }

    /// Set the event broadcast capacity
    #[must_use]
    pub const fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Override the identity function
    #[must_use]
    pub fn with_identity(
        mut self,
        identity: impl Fn(&RequestDescriptor) -> IdentityKey + Send + Sync + 'static,
    ) -> Self {
        self.identity = Some(Arc::new(identity));
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_policy: CachePolicy::default(),
            default_headers: Headers::new(),
            execution: ExecutionContext::default(),
            initial_state: None,
            default_stack_size: DEFAULT_STACK_SIZE,
            event_capacity: 64,
            identity: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("cache_policy", &self.cache_policy)
            .field("default_headers", &self.default_headers)
            .field("execution", &self.execution)
            .field("initial_state", &self.initial_state.as_ref().map(|s| s.entries.len()))
            .field("default_stack_size", &self.default_stack_size)
            .field("event_capacity", &self.event_capacity)
            .field("identity", &self.identity.as_ref().map(|_| "custom"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fetch_cache_core::result::FetchError;
    use serde_json::json;

    fn ok() -> FetchResult {
        FetchResult::success(json!(1), 200, Headers::new())
    }

    fn failed() -> FetchResult {
        FetchResult::failure(FetchError::transport("down"))
    }

    #[test]
    fn reads_policy_caches_get_errors_too() {
        let get = RequestDescriptor::get("/foo");
        let post = RequestDescriptor::post("/foo");

        assert!(CachePolicy::Reads.should_cache(&get, &ok()));
        assert!(CachePolicy::Reads.should_cache(&get, &failed()));
        assert!(!CachePolicy::Reads.should_cache(&post, &ok()));
    }

    #[test]
    fn success_only_policy_skips_errors() {
        let get = RequestDescriptor::get("/foo");
        assert!(CachePolicy::ReadsSuccessOnly.should_cache(&get, &ok()));
        assert!(!CachePolicy::ReadsSuccessOnly.should_cache(&get, &failed()));
    }

    #[test]
    fn custom_policy_sees_request_and_outcome() {
        let policy = CachePolicy::custom(|request, outcome| {
            request.url().starts_with("/cached") && outcome.status == Some(200)
        });
        assert!(policy.should_cache(&RequestDescriptor::post("/cached/1"), &ok()));
        assert!(!policy.should_cache(&RequestDescriptor::get("/other"), &ok()));
        assert_eq!(format!("{policy:?}"), "Custom(..)");
    }

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.default_stack_size, 3);
        assert_eq!(config.execution, ExecutionContext::Interactive);
        assert!(config.initial_state.is_none());
        assert!(config.identity.is_none());
    }
}
