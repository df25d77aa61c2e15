//! Integration tests for query eviction stacks
//!
//! A query keeps the store entries of its most recent keys and evicts the
//! rest, unless another query still tracks them.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use fetch_cache_core::identity::IdentityKey;
use fetch_cache_core::request::{Headers, RequestDescriptor};
use fetch_cache_core::result::FetchResult;
use fetch_cache_runtime::{FetchClient, FetchMorePlan, Query, QueryOptions};
use fetch_cache_testing::MockDispatcher;
use fetch_cache_testing::properties::arb_path;
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// Test Fixtures
// ============================================================================

fn letters_dispatcher() -> MockDispatcher {
    ["/a", "/b", "/c", "/d", "/e"]
        .into_iter()
        .fold(MockDispatcher::new(), |dispatcher, url| {
            dispatcher.ok_json(url, json!(url))
        })
}

fn key(url: &str) -> IdentityKey {
    IdentityKey::new(format!("GET:{url}"))
}

fn primaries(query: &Query) -> Vec<IdentityKey> {
    query.frames().iter().map(|frame| frame.primary().clone()).collect()
}

fn stored(client: &FetchClient) -> Vec<IdentityKey> {
    client.get_state().entries.into_keys().collect()
}

async fn visit(query: &Query, url: &str) {
    query.request(&RequestDescriptor::get(url), &QueryOptions::default(), None);
    query.settled().await;
}

// ============================================================================
// Eviction
// ============================================================================

#[tokio::test]
async fn test_fourth_key_evicts_the_oldest() {
    let client = FetchClient::new(letters_dispatcher());
    let query = Query::new(client.clone());

    for url in ["/a", "/b", "/c", "/d"] {
        visit(&query, url).await;
    }

    assert_eq!(primaries(&query), vec![key("/b"), key("/c"), key("/d")]);
    assert_eq!(stored(&client), vec![key("/b"), key("/c"), key("/d")]);
    assert_eq!(client.tracked_keys(), vec![key("/b"), key("/c"), key("/d")]);
}

#[tokio::test]
async fn test_revisiting_promotes_instead_of_duplicating() {
    let dispatcher = letters_dispatcher();
    let client = FetchClient::new(dispatcher.clone());
    let query = Query::new(client.clone());

    for url in ["/a", "/b", "/c", "/a", "/d"] {
        visit(&query, url).await;
    }

    assert_eq!(primaries(&query), vec![key("/c"), key("/a"), key("/d")]);
    assert_eq!(stored(&client), vec![key("/a"), key("/c"), key("/d")]);
    // /a came back from the store
    assert_eq!(dispatcher.call_count(), 4);
}

#[tokio::test]
async fn test_stack_size_option_is_honored() {
    let client = FetchClient::new(letters_dispatcher());
    let query = Query::new(client.clone());
    let options = QueryOptions::default().with_stack_size(1);

    for url in ["/a", "/b"] {
        query.request(&RequestDescriptor::get(url), &options, None);
        query.settled().await;
    }

    assert_eq!(stored(&client), vec![key("/b")]);
}

#[tokio::test]
async fn test_shared_keys_survive_other_query_evictions() {
    let client = FetchClient::new(letters_dispatcher());
    let left = Query::new(client.clone());
    let right = Query::new(client.clone());

    visit(&right, "/a").await;
    for url in ["/a", "/b", "/c", "/d"] {
        visit(&left, url).await;
    }

    assert!(client.get(&key("/a")).is_some());
    right.unmount();
    assert!(client.get(&key("/a")).is_none());
}

#[tokio::test]
async fn test_derived_keys_leave_with_their_frame() {
    let dispatcher = letters_dispatcher().ok_json("/a?page=2", json!(["a2"]));
    let client = FetchClient::new(dispatcher);
    let query = Query::new(client.clone());

    visit(&query, "/a").await;
    let merged = query
        .fetch_more(|_| {
            Some(FetchMorePlan::new(RequestDescriptor::get("/a?page=2"), |next, previous| {
                json!([previous, next])
            }))
        })
        .await;
    assert_eq!(merged.data, Some(json!(["/a", ["a2"]])));
    assert_eq!(query.frames()[0].derived(), &[key("/a?page=2")]);

    for url in ["/b", "/c", "/d"] {
        visit(&query, url).await;
    }

    assert!(client.get(&key("/a")).is_none());
    assert!(client.get(&key("/a?page=2")).is_none());
}

#[tokio::test]
async fn test_key_evicted_in_flight_never_lands_in_store() {
    let dispatcher = letters_dispatcher();
    let release_slow = dispatcher.defer("/slow");
    let client = FetchClient::new(dispatcher);
    let query = Query::new(client.clone());
    let options = QueryOptions::default().with_stack_size(1);

    query.request(&RequestDescriptor::get("/slow"), &options, None);
    let slow = client.in_flight(&key("/slow")).unwrap();
    query.request(&RequestDescriptor::get("/b"), &options, None);
    query.settled().await;

    release_slow
        .send(Ok(FetchResult::success(json!("late"), 200, Headers::new())))
        .unwrap();
    slow.await;

    assert_eq!(primaries(&query), vec![key("/b")]);
    assert_eq!(client.tracked_keys(), vec![key("/b")]);
    assert_eq!(stored(&client), vec![key("/b")]);
}

#[tokio::test]
async fn test_dropped_query_request_still_settles() {
    let dispatcher = letters_dispatcher();
    let client = FetchClient::new(dispatcher.clone());
    let query = Query::new(client.clone());

    let first = query.request(&RequestDescriptor::get("/a"), &QueryOptions::default(), None);
    assert!(first.loading);
    tokio::task::yield_now().await;

    assert_eq!(dispatcher.call_count(), 1);
    assert!(client.get(&key("/a")).is_some());
    assert_eq!(query.result().data, Some(json!("/a")));
}

#[tokio::test]
async fn test_unmount_evicts_every_tracked_entry() {
    let client = FetchClient::new(letters_dispatcher());
    let query = Query::new(client.clone());
    visit(&query, "/a").await;
    visit(&query, "/b").await;

    query.unmount();

    assert!(stored(&client).is_empty());
    assert!(client.tracked_keys().is_empty());
    assert_eq!(client.listener_count(&key("/b")), 0);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn prop_store_never_outgrows_the_stack(paths in prop::collection::vec(arb_path(), 1..12)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let dispatcher = paths.iter().fold(MockDispatcher::new(), |dispatcher, path| {
            dispatcher.ok_json(path.clone(), json!(1))
        });
        let client = FetchClient::new(dispatcher);
        let query = Query::new(client.clone());

        runtime.block_on(async {
            for path in &paths {
                visit(&query, path).await;
            }
        });

        let frames = primaries(&query);
        prop_assert!(frames.len() <= 3);
        prop_assert_eq!(stored(&client), {
            let mut expected = frames.clone();
            expected.sort();
            expected
        });
        let last = paths.last().map(|path| key(path));
        prop_assert_eq!(frames.last().cloned(), last);
    }
}
