//! HTTP attempts against a local upstream that misbehaves on purpose.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower::ServiceExt;

use fetchgate::api::{self, state::AppState};
use fetchgate::config::QueueConfig;
use fetchgate::fetch::{fetch_with_retry, FetchError, FetchTarget, HttpAttempt};
use fetchgate::queue::{Priority, QueueError, RequestQueue};
use fetchgate::retry::{RetryError, RetryPolicy};

type Hits = Arc<AtomicU32>;

async fn json_ok(State(hits): State<Hits>) -> Json<Value> {
    hits.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "response": { "players": [] } }))
}

async fn html_page(State(hits): State<Hits>) -> Html<&'static str> {
    hits.fetch_add(1, Ordering::SeqCst);
    Html("<html><body>Access Denied</body></html>")
}

async fn missing(State(hits): State<Hits>) -> StatusCode {
    hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND
}

async fn throttled(State(hits): State<Hits>) -> StatusCode {
    hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::TOO_MANY_REQUESTS
}

/// 503 twice, then a real answer.
async fn flaky(State(hits): State<Hits>) -> Response {
    let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
    if n < 3 {
        (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
    } else {
        Json(json!({ "attempt": n })).into_response()
    }
}

async fn spawn_upstream() -> (String, Hits) {
    let hits = Hits::default();
    let app = Router::new()
        .route("/json", get(json_ok))
        .route("/html", get(html_page))
        .route("/missing", get(missing))
        .route("/throttled", get(throttled))
        .route("/flaky", get(flaky))
        .with_state(hits.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), hits)
}

fn fast_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
    }
}

fn fast_queue() -> RequestQueue {
    RequestQueue::new(&QueueConfig {
        max_concurrent: 2,
        max_retries: 2,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        ..QueueConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_fetch_with_retry_recovers_from_503() {
    let (base, hits) = spawn_upstream().await;
    let client = reqwest::Client::new();

    let response = fetch_with_retry(
        &client,
        FetchTarget::get(format!("{base}/flaky")).expect_json(true),
        &fast_policy(3),
    )
    .await
    .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    let body: Value = response.json().unwrap();
    assert_eq!(body["attempt"], 3);
}

#[tokio::test]
async fn test_not_found_is_rejected_without_retry() {
    let (base, hits) = spawn_upstream().await;
    let queue = fast_queue();
    let attempt = HttpAttempt::new(reqwest::Client::new(), FetchTarget::get(format!("{base}/missing")));

    let err = queue.submit(attempt, Priority::High).await.unwrap_err();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(matches!(
        err,
        QueueError::Failed(RetryError::Rejected {
            attempts: 1,
            source: FetchError::Client { status: 404, .. }
        })
    ));
}

#[tokio::test]
async fn test_html_is_throttling_only_when_json_expected() {
    let (base, hits) = spawn_upstream().await;
    let client = reqwest::Client::new();
    let url = format!("{base}/html");

    let err = fetch_with_retry(&client, FetchTarget::get(&url).expect_json(true), &fast_policy(2))
        .await
        .unwrap_err();
    assert_eq!(err.attempts(), 3);
    assert!(matches!(err.cause(), FetchError::RateLimited { status: 200, .. }));
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let page = fetch_with_retry(&client, FetchTarget::get(&url), &fast_policy(2))
        .await
        .unwrap();
    assert!(page.body.contains("Access Denied"));
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_429_exhausts_retries_with_last_error() {
    let (base, hits) = spawn_upstream().await;
    let queue = fast_queue();
    let attempt = HttpAttempt::new(reqwest::Client::new(), FetchTarget::get(format!("{base}/throttled")));

    let err = queue.submit(attempt, Priority::Low).await.unwrap_err();

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(err.attempts(), Some(3));
    assert_eq!(err.cause().and_then(FetchError::status), Some(429));
}

#[tokio::test]
async fn test_connection_refused_is_retried_as_transport_error() {
    // Reserve a port, then free it so nothing is listening there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = fetch_with_retry(
        &reqwest::Client::new(),
        FetchTarget::get(format!("http://{addr}/")),
        &fast_policy(1),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, RetryError::Exhausted { attempts: 2, .. }));
    assert!(matches!(err.cause(), FetchError::Transport { .. }));
}

async fn post_fetch(state: AppState, payload: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/fetch")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = api::router(state).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1_000_000)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_api_fetch_returns_upstream_body() {
    let (base, _) = spawn_upstream().await;
    let state = AppState {
        queue: fast_queue(),
        client: reqwest::Client::new(),
    };

    let (status, json) = post_fetch(
        state,
        json!({ "url": format!("{base}/json"), "priority": "high", "expect_json": true }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["status"], 200);
    assert!(json["data"]["body"].as_str().unwrap().contains("players"));
    assert!(json["meta"]["request_id"].is_string());
}

#[tokio::test]
async fn test_api_fetch_maps_terminal_errors() {
    let (base, _) = spawn_upstream().await;
    let state = AppState {
        queue: fast_queue(),
        client: reqwest::Client::new(),
    };

    let (status, json) = post_fetch(state.clone(), json!({ "url": format!("{base}/missing") })).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["upstream_status"], 404);
    assert_eq!(json["error"]["attempts"], 1);

    let (status, json) = post_fetch(
        state.clone(),
        json!({ "url": format!("{base}/throttled"), "max_retries": 1 }),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["attempts"], 2);

    assert_eq!(state.queue.failures().len(), 2);
}
