use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use polycache_core::{Cache, CacheSettings, Expiry};
use polycache_http::{cache_middleware, etag_for, ResponseCacheOptions, ResponseCacheState};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

struct Harness {
    app: Router,
    cache: Cache,
    runs: Arc<AtomicUsize>,
}

/// `/items` answers with its run count; `/broken` always fails
async fn harness(options: ResponseCacheOptions) -> Harness {
    let cache = Cache::open(CacheSettings::default()).await.unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let items = {
        let runs = Arc::clone(&runs);
        move || {
            let runs = Arc::clone(&runs);
            async move {
                let run = runs.fetch_add(1, Ordering::SeqCst) + 1;
                ([(header::CONTENT_TYPE, "text/plain")], format!("run {run}"))
            }
        }
    };
    let broken = {
        let runs = Arc::clone(&runs);
        move || {
            let runs = Arc::clone(&runs);
            async move {
                runs.fetch_add(1, Ordering::SeqCst);
                (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response()
            }
        }
    };

    let state = ResponseCacheState::new(cache.clone(), options);
    let app = Router::new()
        .route("/items", get(items))
        .route("/broken", get(broken))
        .layer(from_fn_with_state(state, cache_middleware));

    Harness { app, cache, runs }
}

fn request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_second_request_is_served_from_cache() {
    let h = harness(ResponseCacheOptions::new("1m")).await;

    let first = h.app.clone().oneshot(request("/items")).await.unwrap();
    let second = h.app.clone().oneshot(request("/items")).await.unwrap();

    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(
        second.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain"
    );
    assert_eq!(
        second.headers().get(header::ETAG).unwrap().to_str().unwrap(),
        etag_for("GET /items")
    );
    assert_eq!(body_text(first).await, "run 1");
    assert_eq!(body_text(second).await, "run 1");
    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
    assert!(h.cache.has("GET /items").await.unwrap());
}

#[tokio::test]
async fn test_matching_if_none_match_is_not_modified() {
    let h = harness(ResponseCacheOptions::new("1m")).await;

    let first = h.app.clone().oneshot(request("/items")).await.unwrap();
    let etag = first.headers().get(header::ETAG).unwrap().clone();

    let conditional = Request::builder()
        .uri("/items")
        .header(header::IF_NONE_MATCH, etag.clone())
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(conditional).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(response.headers().get(header::ETAG).unwrap(), &etag);
    assert!(body_text(response).await.is_empty());
    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_if_none_match_gets_full_response() {
    let h = harness(ResponseCacheOptions::new("1m")).await;
    h.app.clone().oneshot(request("/items")).await.unwrap();

    let conditional = Request::builder()
        .uri("/items")
        .header(header::IF_NONE_MATCH, "\"something-else\"")
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(conditional).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "run 1");
}

#[tokio::test]
async fn test_if_none_match_without_cached_entry_runs_handler() {
    let h = harness(ResponseCacheOptions::new("1m")).await;

    let conditional = Request::builder()
        .uri("/items")
        .header(header::IF_NONE_MATCH, etag_for("GET /items"))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(conditional).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_error_responses_are_not_cached_by_default() {
    let h = harness(ResponseCacheOptions::new("1m")).await;

    for _ in 0..2 {
        let response = h.app.clone().oneshot(request("/broken")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::ETAG).is_none());
    }
    assert_eq!(h.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_custom_filter_can_cache_errors() {
    let options = ResponseCacheOptions::new("1m").with_filter(|_, _| true);
    let h = harness(options).await;

    h.app.clone().oneshot(request("/broken")).await.unwrap();
    let response = h.app.clone().oneshot(request("/broken")).await.unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_text(response).await, "boom");
    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_filter_sees_response_body() {
    let options =
        ResponseCacheOptions::new("1m").with_filter(|_, response| response.body != b"run 1");
    let h = harness(options).await;

    h.app.clone().oneshot(request("/items")).await.unwrap();
    h.app.clone().oneshot(request("/items")).await.unwrap();
    let third = h.app.clone().oneshot(request("/items")).await.unwrap();

    assert_eq!(body_text(third).await, "run 2");
    assert_eq!(h.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_custom_key_ignores_query() {
    let options = ResponseCacheOptions::new("1m").with_key(|parts| parts.uri.path().to_string());
    let h = harness(options).await;

    h.app.clone().oneshot(request("/items?page=1")).await.unwrap();
    let response = h.app.clone().oneshot(request("/items?page=2")).await.unwrap();

    assert_eq!(
        response.headers().get(header::ETAG).unwrap().to_str().unwrap(),
        etag_for("/items")
    );
    assert_eq!(body_text(response).await, "run 1");
    assert_eq!(h.runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_default_key_includes_query() {
    let h = harness(ResponseCacheOptions::new("1m")).await;

    h.app.clone().oneshot(request("/items?page=1")).await.unwrap();
    let response = h.app.clone().oneshot(request("/items?page=2")).await.unwrap();

    assert_eq!(body_text(response).await, "run 2");
}

#[tokio::test]
async fn test_entries_expire() {
    let h = harness(ResponseCacheOptions::new(Expiry::Millis(50.0))).await;

    h.app.clone().oneshot(request("/items")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    let response = h.app.clone().oneshot(request("/items")).await.unwrap();

    assert_eq!(body_text(response).await, "run 2");
    assert_eq!(h.runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_oversized_response_is_served_uncached() {
    let mut options = ResponseCacheOptions::new("1m");
    options.max_body = 4;
    let h = harness(options).await;

    for run in 1..=2 {
        let response = h.app.clone().oneshot(request("/items")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::ETAG).is_none());
        assert_eq!(body_text(response).await, format!("run {run}"));
    }
    assert!(!h.cache.has("GET /items").await.unwrap());
}
