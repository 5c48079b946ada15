//! Fetcher behavior against a local mock origin.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pagecore_base::stats::Statistics;
use pagecore_base::timer::{SharedTimer, SystemTimer};
use pagecore_cache::{HttpCache, HttpCacheResult, InMemoryCache};
use pagecore_fetch::{
    CollectingHandler, FetchOutcome, InPlaceRecorder, RateControllingFetcher, ReqwestUrlFetcher,
    RequestContext, UrlFetcher,
};

fn timer() -> SharedTimer {
    Arc::new(SystemTimer::new())
}

fn fetcher(timeout_ms: u64) -> ReqwestUrlFetcher {
    ReqwestUrlFetcher::builder()
        .with_timeout_ms(timeout_ms)
        .build(timer())
        .unwrap()
}

#[tokio::test]
async fn test_success_delivers_headers_then_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/page"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Content-Type", "text/html")
                .set_body_bytes(b"<html>hi</html>".to_vec()),
        )
        .mount(&server)
        .await;

    let fetcher = fetcher(5_000);
    let mut handler = CollectingHandler::new();
    let outcome = fetcher
        .fetch(RequestContext::new(format!("{}/page", server.uri())), &mut handler)
        .await;

    assert_eq!(outcome, FetchOutcome::Success);
    let headers = handler.headers.unwrap();
    assert_eq!(headers.status_code, 200);
    assert_eq!(headers.lookup_first("content-type"), Some("text/html"));
    assert_eq!(handler.body, b"<html>hi</html>");
    assert_eq!(handler.outcome, Some(FetchOutcome::Success));
}

#[tokio::test]
async fn test_request_headers_are_forwarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth"))
        .and(header("X-Probe", "1"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let fetcher = fetcher(5_000);
    let mut handler = CollectingHandler::new();
    let request = RequestContext::new(format!("{}/auth", server.uri())).with_header("X-Probe", "1");
    assert_eq!(fetcher.fetch(request, &mut handler).await, FetchOutcome::Success);
}

#[tokio::test]
async fn test_http_error_status_still_delivers_body() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404).set_body_bytes(b"gone".to_vec()))
        .mount(&server)
        .await;

    let fetcher = fetcher(5_000);
    let mut handler = CollectingHandler::new();
    let outcome = fetcher
        .fetch(
            RequestContext::new(format!("{}/missing", server.uri())),
            &mut handler,
        )
        .await;

    assert_eq!(outcome, FetchOutcome::HttpError(404));
    assert_eq!(handler.headers.unwrap().status_code, 404);
    assert_eq!(handler.body, b"gone");
}

#[tokio::test]
async fn test_slow_origin_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let fetcher = fetcher(300);
    let mut handler = CollectingHandler::new();
    let outcome = fetcher
        .fetch(RequestContext::new(format!("{}/slow", server.uri())), &mut handler)
        .await;

    assert_eq!(outcome, FetchOutcome::TimedOut);
    assert_eq!(handler.outcome, Some(FetchOutcome::TimedOut));
}

#[tokio::test]
async fn test_pre_canceled_request_never_hits_origin() {
    let server = MockServer::start().await;
    // No mounted mocks: any received request would 404 and fail the
    // outcome assertion below.
    let fetcher = fetcher(5_000);
    let mut handler = CollectingHandler::new();
    let request = RequestContext::new(format!("{}/x", server.uri()));
    request.cancel.request();

    let outcome = fetcher.fetch(request, &mut handler).await;
    assert_eq!(outcome, FetchOutcome::Canceled);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unreachable_origin_is_a_connect_error() {
    let fetcher = fetcher(2_000);
    let mut handler = CollectingHandler::new();
    let outcome = fetcher
        .fetch(RequestContext::new("http://127.0.0.1:1/"), &mut handler)
        .await;
    assert_eq!(outcome, FetchOutcome::ConnectError);
}

#[tokio::test]
async fn test_rate_controlled_fetch_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
        .mount(&server)
        .await;

    let stats = RateControllingFetcher::register_stats(Statistics::builder()).local();
    let limited = RateControllingFetcher::new(Arc::new(fetcher(5_000)), &stats, 2, 2, 10);

    for i in 0..5 {
        let mut handler = CollectingHandler::new();
        let outcome = limited
            .fetch(RequestContext::new(format!("{}/r{i}", server.uri())), &mut handler)
            .await;
        assert_eq!(outcome, FetchOutcome::Success);
    }
    assert_eq!(stats.find_variable("fetch_active").get(), 0);
}

#[tokio::test]
async fn test_recorder_captures_live_fetch_into_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/asset.css"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("Cache-Control", "max-age=600")
                .set_body_bytes(b"body{color:red}".to_vec()),
        )
        .mount(&server)
        .await;

    let stats = HttpCache::register_stats(Statistics::builder()).local();
    let cache = Arc::new(HttpCache::new(
        Arc::new(InMemoryCache::new("mem")),
        timer(),
        &stats,
    ));
    let pool = Arc::new(InPlaceRecorder::new(cache.clone(), 1 << 20, 4));

    let url = format!("{}/asset.css", server.uri());
    let fetcher = fetcher(5_000);
    let mut handler = pool.wrap(url.clone(), Box::new(CollectingHandler::new()));
    let outcome = fetcher.fetch(RequestContext::new(url.clone()), &mut handler).await;
    assert_eq!(outcome, FetchOutcome::Success);

    match cache.get(&url).await {
        HttpCacheResult::Found { body, .. } => assert_eq!(body.as_slice(), b"body{color:red}"),
        other => panic!("expected recorded hit, got {other:?}"),
    }
}
