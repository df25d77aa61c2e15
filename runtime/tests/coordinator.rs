//! Integration tests for the request coordinator
//!
//! Covers deduplication, cache writes under each policy, hydration from a
//! serialized snapshot, listener isolation and the reqwest transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use fetch_cache_core::bus::EventHandlers;
use fetch_cache_core::cache::{CacheSnapshot, LocalCache};
use fetch_cache_core::identity::IdentityKey;
use fetch_cache_core::request::{Headers, RequestBody, RequestDescriptor};
use fetch_cache_core::result::{FetchError, FetchResult, ResultPatch};
use fetch_cache_core::transport::{Dispatcher, HttpDispatcher};
use fetch_cache_runtime::{
    CacheMutation, CachePolicy, ClientConfig, ClientRegistry, FetchClient, ReqwestFetch,
};
use fetch_cache_testing::helpers::init_test_tracing;
use fetch_cache_testing::{MockDispatcher, test_clock};
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{body_string, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Test Fixtures
// ============================================================================

fn foo_key() -> IdentityKey {
    IdentityKey::new("GET:/foo")
}

fn foo_dispatcher() -> MockDispatcher {
    MockDispatcher::new().ok_json("/foo", json!({ "foo": "bar" }))
}

fn failing_client(policy: CachePolicy) -> FetchClient {
    FetchClient::with_config(
        MockDispatcher::new().fail("/foo", "Failed to fetch /foo"),
        ClientConfig::default().with_cache_policy(policy),
    )
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn test_eight_identical_dispatches_share_one_request() {
    init_test_tracing();
    let dispatcher = foo_dispatcher();
    let client = FetchClient::new(dispatcher.clone());

    let pending: Vec<_> = (0..8)
        .map(|_| client.dispatch(&RequestDescriptor::get("/foo")))
        .collect();
    let outcomes = join_all(pending).await;

    assert_eq!(dispatcher.call_count(), 1);
    assert_eq!(outcomes.len(), 8);
    assert!(outcomes.iter().all(|outcome| *outcome == outcomes[0]));
}

#[tokio::test]
async fn test_distinct_bodies_are_distinct_requests() {
    let dispatcher = MockDispatcher::new().ok_json("/todos", json!({ "ok": true }));
    let client = FetchClient::new(dispatcher.clone());

    let first = RequestDescriptor::post("/todos").with_body(RequestBody::form([("title", "a")]));
    let second = RequestDescriptor::post("/todos").with_body(RequestBody::form([("title", "b")]));
    assert_ne!(client.identity_of(&first), client.identity_of(&second));

    join_all([client.dispatch(&first), client.dispatch(&second)]).await;

    assert_eq!(dispatcher.call_count(), 2);
}

#[tokio::test]
async fn test_settled_key_dispatches_again() {
    let dispatcher = foo_dispatcher();
    let client = FetchClient::new(dispatcher.clone());

    client.dispatch(&RequestDescriptor::get("/foo")).await;
    client.dispatch(&RequestDescriptor::get("/foo")).await;

    assert_eq!(dispatcher.call_count(), 2);
}

// ============================================================================
// Settled outcomes
// ============================================================================

#[tokio::test]
async fn test_foo_success_is_cached_with_timestamp() {
    let client = FetchClient::with_cache(
        Arc::new(foo_dispatcher()),
        Arc::new(LocalCache::with_clock(Arc::new(test_clock()))),
        ClientConfig::default(),
    );

    let outcome = client.dispatch(&RequestDescriptor::get("/foo")).await;

    assert_eq!(
        serde_json::to_value(&outcome).unwrap(),
        json!({ "data": { "foo": "bar" }, "status": 200, "headers": {} })
    );
    let item = client.get_item(&foo_key()).unwrap();
    assert_eq!(
        serde_json::to_value(&item).unwrap(),
        json!({
            "id": "GET:/foo",
            "value": { "data": { "foo": "bar" }, "status": 200, "headers": {} },
            "cachedAt": "2025-01-01T00:00:00Z"
        })
    );
}

#[tokio::test]
async fn test_foo_failure_is_cached_under_default_policy() {
    let client = failing_client(CachePolicy::Reads);

    let outcome = client.dispatch(&RequestDescriptor::get("/foo")).await;

    assert_eq!(outcome.error.as_ref().unwrap().message(), "Failed to fetch /foo");
    assert_eq!(client.get(&foo_key()), Some(outcome));
}

#[tokio::test]
async fn test_foo_failure_is_not_cached_when_success_only() {
    let client = failing_client(CachePolicy::ReadsSuccessOnly);

    let outcome = client.dispatch(&RequestDescriptor::get("/foo")).await;

    assert_eq!(outcome.error, Some(FetchError::transport("Failed to fetch /foo")));
    assert!(client.get(&foo_key()).is_none());
}

#[tokio::test]
async fn test_custom_policy_decides_per_outcome() {
    let dispatcher = MockDispatcher::new()
        .ok_json("/keep", json!(1))
        .ok_json("/skip", json!(2));
    let client = FetchClient::with_config(
        dispatcher,
        ClientConfig::default()
            .with_cache_policy(CachePolicy::custom(|request, _| request.url() == "/keep")),
    );

    client.dispatch(&RequestDescriptor::get("/keep")).await;
    client.dispatch(&RequestDescriptor::get("/skip")).await;

    assert!(client.get(&IdentityKey::new("GET:/keep")).is_some());
    assert!(client.get(&IdentityKey::new("GET:/skip")).is_none());
}

// ============================================================================
// Snapshots
// ============================================================================

#[tokio::test]
async fn test_snapshot_hydrates_a_fresh_client() {
    let server = FetchClient::new(foo_dispatcher());
    server.dispatch(&RequestDescriptor::get("/foo")).await;
    let serialized = serde_json::to_string(&server.get_state()).unwrap();

    let snapshot: CacheSnapshot = serde_json::from_str(&serialized).unwrap();
    let dispatcher = MockDispatcher::new();
    let browser = FetchClient::with_config(
        dispatcher.clone(),
        ClientConfig::default().with_initial_state(snapshot),
    );

    assert_eq!(browser.get_state(), server.get_state());
    assert_eq!(browser.get(&foo_key()).unwrap().data, Some(json!({ "foo": "bar" })));
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn test_set_state_replaces_everything() {
    let client = FetchClient::new(foo_dispatcher());
    client.dispatch(&RequestDescriptor::get("/foo")).await;

    client.set_state(CacheSnapshot::default());

    assert!(client.get_state().is_empty());
}

// ============================================================================
// Notifications
// ============================================================================

#[tokio::test]
async fn test_listeners_only_hear_their_key() {
    let dispatcher = foo_dispatcher().ok_json("/bar", json!("bar"));
    let client = FetchClient::new(dispatcher);
    let heard = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&heard);
    let foo = client.listen(
        foo_key(),
        EventHandlers::new().on_update(move |value| sink.lock().push(value.data.clone())),
    );

    client.dispatch(&RequestDescriptor::get("/bar")).await;
    client.dispatch(&RequestDescriptor::get("/foo")).await;

    assert_eq!(*heard.lock(), vec![Some(json!({ "foo": "bar" }))]);

    foo.unsubscribe();
    client.dispatch(&RequestDescriptor::get("/foo")).await;
    assert_eq!(heard.lock().len(), 1);
}

#[tokio::test]
async fn test_event_stream_sees_updates_and_revalidations() {
    let client = FetchClient::new(foo_dispatcher());
    let mut events = client.events();

    client.dispatch(&RequestDescriptor::get("/foo")).await;
    client.revalidate(&foo_key());

    let first = events.recv().await.unwrap();
    let second = events.recv().await.unwrap();
    assert_eq!(first.key(), &foo_key());
    assert!(matches!(first, fetch_cache_core::bus::FetchEvent::Update { .. }));
    assert!(matches!(second, fetch_cache_core::bus::FetchEvent::Revalidate { .. }));
}

// ============================================================================
// Registry
// ============================================================================

#[tokio::test]
async fn test_global_registry_mutations_reach_listeners() {
    let client = FetchClient::new(foo_dispatcher());
    client.dispatch(&RequestDescriptor::get("/foo")).await;
    let heard = Arc::new(Mutex::new(None));

    let sink = Arc::clone(&heard);
    let _listener = client.listen(
        foo_key(),
        EventHandlers::new().on_update(move |value| *sink.lock() = value.data.clone()),
    );

    ClientRegistry::global().register(client.clone()).unwrap();
    fetch_cache_runtime::mutate_fetch_cache(
        &foo_key(),
        CacheMutation::Merge(ResultPatch::data(json!({ "foo": "baz" }))),
    )
    .unwrap();
    ClientRegistry::global().unregister();

    assert_eq!(*heard.lock(), Some(json!({ "foo": "baz" })));
    assert_eq!(client.get(&foo_key()).unwrap().status, Some(200));
}

// ============================================================================
// HTTP transport
// ============================================================================

#[tokio::test]
async fn test_reqwest_transport_decodes_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/foo"))
        .and(header("x-client", "tests"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "foo": "bar" }))
                .insert_header("x-request-id", "42"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let base = url::Url::parse(&server.uri()).unwrap();
    let client = FetchClient::with_config(
        HttpDispatcher::new(ReqwestFetch::new().with_base_url(base)),
        ClientConfig::default().with_default_header("x-client", "tests"),
    );

    let outcome = client.dispatch(&RequestDescriptor::get("/foo")).await;

    assert_eq!(outcome.data, Some(json!({ "foo": "bar" })));
    assert_eq!(outcome.status, Some(200));
    assert_eq!(outcome.headers.unwrap()["x-request-id"], "42");
}

#[tokio::test]
async fn test_reqwest_transport_sends_form_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/todos"))
        .and(body_string("title=write+docs&done=false"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 7 })))
        .mount(&server)
        .await;

    let dispatcher = HttpDispatcher::new(
        ReqwestFetch::new().with_base_url(url::Url::parse(&server.uri()).unwrap()),
    );
    let request = RequestDescriptor::post("/todos")
        .with_body(RequestBody::form([("title", "write docs"), ("done", "false")]));

    let outcome = dispatcher.dispatch(&request).await.unwrap();

    assert_eq!(outcome.data, Some(json!({ "id": 7 })));
    assert_eq!(outcome.status, Some(201));
}

#[tokio::test]
async fn test_reqwest_transport_reports_malformed_json() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let client = FetchClient::new(HttpDispatcher::new(
        ReqwestFetch::new().with_base_url(url::Url::parse(&server.uri()).unwrap()),
    ));

    let outcome = client.dispatch(&RequestDescriptor::get("/broken")).await;

    assert_eq!(outcome.status, Some(500));
    assert!(outcome.data.is_none());
    assert!(outcome.error.unwrap().message().starts_with("Error parsing json"));
}

#[tokio::test]
async fn test_unreachable_host_is_a_transport_error() {
    let client = FetchClient::new(HttpDispatcher::new(ReqwestFetch::new()));

    let outcome = client
        .dispatch(&RequestDescriptor::get("http://127.0.0.1:1/foo"))
        .await;

    assert!(matches!(outcome.error, Some(FetchError::Transport { .. })));
    assert!(outcome.status.is_none());
    assert_eq!(outcome.headers, None::<Headers>);
}

#[tokio::test]
async fn test_replace_mutation_overwrites() {
    let registry = ClientRegistry::new();
    let client = FetchClient::new(MockDispatcher::new());
    registry.register(client.clone()).unwrap();

    registry
        .mutate(
            &foo_key(),
            CacheMutation::Replace(FetchResult::success(json!(9), 200, Headers::new())),
        )
        .unwrap();

    assert_eq!(client.get(&foo_key()).unwrap().data, Some(json!(9)));
}
