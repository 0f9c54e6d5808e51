mod common;

use std::sync::Arc;

use futures_util::StreamExt;
use pipex::prelude::*;

use common::{MockTransport, ScriptedOutcome};

fn pipeline_over(transport: Arc<MockTransport>) -> Pipeline {
    Pipeline::builder()
        .client_name("pipex-tests")
        .transport(transport)
        .retry(RetryPolicy::disabled())
        .api_version("2023-06-01")
        .build()
        .expect("default chain builds")
}

fn widgets_pager(pipeline: Pipeline) -> Pager<String> {
    Pager::new(
        pipeline,
        Context::new(),
        Request::get("https://api.example.com/v1/widgets?api-version=2023-06-01"),
        json_page_extractor::<String>("value", "nextLink"),
    )
}

#[tokio::test]
async fn pager_walks_every_continuation_and_yields_items_in_order() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(200).body(
            &br#"{"value":["a","b"],"nextLink":"https://api.example.com/v1/widgets?skip=2&api-version=2020-01-01"}"#[..],
        ),
        ScriptedOutcome::response(200).body(
            &br#"{"value":[],"nextLink":"https://api.example.com/v1/widgets?skip=2&marker=m2&api-version=2020-01-01"}"#[..],
        ),
        ScriptedOutcome::response(200).body(&br#"{"value":["c"]}"#[..]),
    ]);
    let mut pager = widgets_pager(pipeline_over(Arc::clone(&transport)));

    let mut items = Vec::new();
    while let Some(item) = pager.next().await {
        items.push(item.expect("page fetches succeed"));
    }
    assert_eq!(items, vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]);

    // Forward-only and non-restartable: the sequence stays exhausted.
    assert!(pager.next().await.is_none());
    assert!(pager.next_page().await.is_none());

    let requests = transport.requests();
    assert_eq!(requests.len(), 3, "the empty page must not terminate the walk");
    assert_eq!(
        requests[1].url,
        "https://api.example.com/v1/widgets?skip=2&api-version=2023-06-01",
        "continuation keeps its parameters but the api-version is overwritten"
    );
    assert_eq!(
        requests[2].url,
        "https://api.example.com/v1/widgets?skip=2&marker=m2&api-version=2023-06-01"
    );
}

#[tokio::test]
async fn pager_without_configured_api_version_follows_links_verbatim() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(200).body(
            &br#"{"value":["a"],"nextLink":"https://api.example.com/v1/widgets?skip=1&api-version=2020-01-01"}"#[..],
        ),
        ScriptedOutcome::response(200).body(&br#"{"value":[]}"#[..]),
    ]);
    let pipeline = Pipeline::builder()
        .transport(Arc::clone(&transport) as Arc<dyn Transport>)
        .retry(RetryPolicy::disabled())
        .build()
        .expect("default chain builds");
    let mut pager = Pager::new(
        pipeline,
        Context::new(),
        Request::get("https://api.example.com/v1/widgets"),
        json_page_extractor::<String>("value", "nextLink"),
    );

    while let Some(item) = pager.next().await {
        item.expect("page fetches succeed");
    }
    let requests = transport.requests();
    assert_eq!(
        requests[1].url,
        "https://api.example.com/v1/widgets?skip=1&api-version=2020-01-01"
    );
}

#[tokio::test]
async fn next_page_exposes_page_boundaries() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(200).body(
            &br#"{"value":["a","b"],"nextLink":"https://api.example.com/v1/widgets?skip=2"}"#[..],
        ),
        ScriptedOutcome::response(200).body(&br#"{"value":["c"]}"#[..]),
    ]);
    let mut pager = widgets_pager(pipeline_over(Arc::clone(&transport)));

    let first = pager
        .next_page()
        .await
        .expect("first page exists")
        .expect("first page fetches");
    assert_eq!(first.items, vec!["a".to_owned(), "b".to_owned()]);
    assert!(first.continuation.is_some());

    let second = pager
        .next_page()
        .await
        .expect("second page exists")
        .expect("second page fetches");
    assert_eq!(second.items, vec!["c".to_owned()]);
    assert!(second.continuation.is_none());

    assert!(pager.next_page().await.is_none());
}

#[tokio::test]
async fn pager_stream_adapter_yields_the_same_sequence() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(200).body(
            &br#"{"value":["a","b"],"nextLink":"https://api.example.com/v1/widgets?skip=2"}"#[..],
        ),
        ScriptedOutcome::response(200).body(&br#"{"value":["c"]}"#[..]),
    ]);
    let pager = widgets_pager(pipeline_over(Arc::clone(&transport)));

    let items: Vec<String> = pager
        .into_stream()
        .map(|item| item.expect("page fetches succeed"))
        .collect()
        .await;
    assert_eq!(items, vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]);
}

#[tokio::test]
async fn page_fetch_errors_surface_with_full_response_context() {
    let transport = MockTransport::script([
        ScriptedOutcome::response(200).body(
            &br#"{"value":["a"],"nextLink":"https://api.example.com/v1/widgets?skip=1"}"#[..],
        ),
        ScriptedOutcome::response(409).body(&b"listing conflict"[..]),
    ]);
    let mut pager = widgets_pager(pipeline_over(Arc::clone(&transport)));

    let first = pager.next().await.expect("first item").expect("first page fetches");
    assert_eq!(first, "a");

    let error = pager
        .next()
        .await
        .expect("second fetch is attempted")
        .expect_err("conflict surfaces as an error");
    assert_eq!(error.http_status(), Some(409));
    assert_eq!(error.http_error_kind(), Some(HttpErrorKind::Conflict));
}
