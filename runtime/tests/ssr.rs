//! Integration tests for server-side rendering
//!
//! Renders small component trees against a server client and checks the
//! drain loop converges on fully loaded markup and a complete snapshot.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use fetch_cache_core::error::UsageError;
use fetch_cache_core::identity::IdentityKey;
use fetch_cache_core::request::RequestDescriptor;
use fetch_cache_runtime::{
    CachePolicy, ClientConfig, ExecutionContext, FetchClient, MarkupRenderer, Query, QueryOptions,
    QueryResult, RenderContext, collect_cache_after_render, render_and_drain,
};
use fetch_cache_testing::MockDispatcher;
use fetch_cache_testing::helpers::init_test_tracing;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

// ============================================================================
// Test Fixtures
// ============================================================================

struct Page {
    urls: Vec<&'static str>,
}

fn server_client(dispatcher: MockDispatcher) -> FetchClient {
    FetchClient::with_config(
        dispatcher,
        ClientConfig::default().with_execution(ExecutionContext::Server),
    )
}

fn render_result(result: &QueryResult) -> String {
    match (&result.data, &result.error) {
        _ if result.loading => "loading".to_string(),
        (_, Some(error)) => format!("error: {}", error.message()),
        (Some(data), None) => data.to_string(),
        (None, None) => "idle".to_string(),
    }
}

fn render_page(page: &Page, context: &RenderContext) -> String {
    page.urls
        .iter()
        .map(|url| {
            let result = context
                .use_fetch(&RequestDescriptor::get(*url), &QueryOptions::default())
                .unwrap();
            format!("<li>{}</li>", render_result(&result))
        })
        .collect()
}

// ============================================================================
// Drain loop
// ============================================================================

#[tokio::test]
async fn test_two_fetches_converge_in_one_drain() {
    init_test_tracing();
    let dispatcher = MockDispatcher::new()
        .ok_json("/users", json!(["ada"]))
        .ok_json("/posts", json!(["hello"]));
    let client = server_client(dispatcher.clone());
    let passes = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&passes);
    let mut renderer = MarkupRenderer::new(client.clone()).on_before_render(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let page = Page {
        urls: vec!["/users", "/posts"],
    };

    let markup = renderer.render(&page, render_page).await;

    assert_eq!(markup, r#"<li>["ada"]</li><li>["hello"]</li>"#);
    assert_eq!(passes.load(Ordering::SeqCst), 2);
    assert_eq!(dispatcher.call_count(), 2);

    let snapshot = client.get_state();
    let keys: Vec<_> = snapshot.entries.keys().cloned().collect();
    assert_eq!(keys, vec![IdentityKey::new("GET:/posts"), IdentityKey::new("GET:/users")]);
}

#[tokio::test]
async fn test_dependent_fetch_needs_a_second_drain() {
    let dispatcher = MockDispatcher::new()
        .ok_json("/me", json!({ "id": 7 }))
        .ok_json("/users/7/posts", json!(["first"]));
    let client = server_client(dispatcher);

    let markup = MarkupRenderer::new(client)
        .render(&(), |_, context| {
            let me = context
                .use_fetch(&RequestDescriptor::get("/me"), &QueryOptions::default())
                .unwrap();
            let Some(id) = me.data.as_ref().and_then(|me| me["id"].as_i64()) else {
                return render_result(&me);
            };
            let posts = context
                .use_fetch(
                    &RequestDescriptor::get(format!("/users/{id}/posts")),
                    &QueryOptions::default(),
                )
                .unwrap();
            render_result(&posts)
        })
        .await;

    assert_eq!(markup, r#"["first"]"#);
}

#[tokio::test]
async fn test_failed_fetch_renders_its_error() {
    let client = server_client(MockDispatcher::new().fail("/foo", "Failed to fetch /foo"));
    let page = Page { urls: vec!["/foo"] };

    let markup = MarkupRenderer::new(client).render(&page, render_page).await;

    assert_eq!(markup, "<li>error: Failed to fetch /foo</li>");
}

#[tokio::test]
async fn test_opted_out_query_stays_loading() {
    let dispatcher = MockDispatcher::new().ok_json("/foo", json!(1));
    let client = server_client(dispatcher.clone());

    let markup = MarkupRenderer::new(client)
        .render(&(), |_, context| {
            let result = context
                .use_fetch(
                    &RequestDescriptor::get("/foo"),
                    &QueryOptions::default().with_ssr(false),
                )
                .unwrap();
            render_result(&result)
        })
        .await;

    assert_eq!(markup, "loading");
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn test_queries_register_with_bare_drain_loop() {
    let dispatcher = MockDispatcher::new().ok_json("/foo", json!("foo"));
    let client = server_client(dispatcher);
    let query = Query::new(client);

    let markup = render_and_drain(&query, |query, ssr| {
        let request = RequestDescriptor::get("/foo");
        let result = query.request(&request, &QueryOptions::default(), Some(ssr));
        render_result(&result)
    })
    .await;

    assert_eq!(markup, r#""foo""#);
}

// ============================================================================
// Cache capture
// ============================================================================

#[tokio::test]
async fn test_collect_cache_after_single_pass() {
    let dispatcher = MockDispatcher::new()
        .ok_json("/users", json!(["ada"]))
        .ok_json("/posts", json!(["hello"]));
    let client = FetchClient::new(dispatcher);
    let page = Page {
        urls: vec!["/users", "/posts"],
    };

    let snapshot = collect_cache_after_render(&client, &page, render_page).await;

    assert_eq!(snapshot.entries.len(), 2);
    assert_eq!(
        snapshot.entries[&IdentityKey::new("GET:/users")].value.data,
        Some(json!(["ada"]))
    );
}

#[tokio::test]
async fn test_hydrated_client_renders_without_fetching() {
    let server = server_client(MockDispatcher::new().ok_json("/foo", json!({ "foo": "bar" })));
    let page = Page { urls: vec!["/foo"] };
    let server_markup = MarkupRenderer::new(server.clone()).render(&page, render_page).await;

    let dispatcher = MockDispatcher::new();
    let browser = FetchClient::with_config(
        dispatcher.clone(),
        ClientConfig::default()
            .with_cache_policy(CachePolicy::ReadsSuccessOnly)
            .with_initial_state(server.get_state()),
    );
    let browser_markup = render_page(&page, &RenderContext::new(browser));

    assert_eq!(browser_markup, server_markup);
    assert_eq!(dispatcher.call_count(), 0);
}

#[tokio::test]
async fn test_interactive_render_loads_on_a_later_pass() {
    let dispatcher = MockDispatcher::new().ok_json("/foo", json!("foo"));
    let context = RenderContext::new(FetchClient::new(dispatcher.clone()));
    let page = Page { urls: vec!["/foo"] };

    assert_eq!(render_page(&page, &context), "<li>loading</li>");
    assert_eq!(render_page(&page, &context), "<li>loading</li>");
    tokio::task::yield_now().await;

    assert_eq!(render_page(&page, &context), r#"<li>"foo"</li>"#);
    assert_eq!(dispatcher.call_count(), 1);
}

#[test]
fn test_rendering_without_provider_is_a_usage_error() {
    let error = RenderContext::detached()
        .use_fetch(&RequestDescriptor::get("/foo"), &QueryOptions::default())
        .unwrap_err();

    assert_eq!(error, UsageError::MissingProvider);
    assert!(!error.to_string().is_empty());
}
