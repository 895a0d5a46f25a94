//! API route definitions.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use super::state::AppState;
use crate::fetch::{FetchError, FetchTarget, HttpAttempt};
use crate::queue::{Priority, QueueError};

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/queue/stats", get(queue_stats))
        .route("/queue/failures", get(list_failures).delete(clear_failures))
        .route("/queue/pause", post(pause_low_priority))
        .route("/queue/resume", post(resume_low_priority))
        .route("/fetch", post(fetch))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

async fn queue_stats(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "data": state.queue.stats(), "meta": meta() }))
}

async fn list_failures(State(state): State<AppState>) -> Json<Value> {
    let failures = state.queue.failures();
    let total = failures.len();
    Json(json!({ "data": failures, "meta": { "total": total } }))
}

async fn clear_failures(State(state): State<AppState>) -> StatusCode {
    state.queue.clear_failures();
    StatusCode::NO_CONTENT
}

async fn pause_low_priority(State(state): State<AppState>) -> Json<Value> {
    state.queue.pause_low_priority();
    Json(json!({ "data": state.queue.stats() }))
}

async fn resume_low_priority(State(state): State<AppState>) -> Json<Value> {
    state.queue.resume_low_priority();
    Json(json!({ "data": state.queue.stats() }))
}

#[derive(Debug, Deserialize)]
struct FetchRequest {
    url: String,
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    expect_json: bool,
    max_retries: Option<u32>,
}

async fn fetch(
    State(state): State<AppState>,
    Json(req): Json<FetchRequest>,
) -> Result<Json<Value>, ApiError> {
    match reqwest::Url::parse(&req.url) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => {}
        _ => return Err(ApiError::BadRequest(format!("not an http(s) url: {}", req.url))),
    }

    let target = FetchTarget::get(req.url).expect_json(req.expect_json);
    let attempt = HttpAttempt::new(state.client.clone(), target);
    let outcome = match req.max_retries {
        Some(n) => state.queue.submit_with_retries(attempt, req.priority, n),
        None => state.queue.submit(attempt, req.priority),
    };

    let request_id = outcome.id();
    let response = outcome
        .await
        .map_err(|error| ApiError::Queue { request_id, error })?;

    Ok(Json(json!({
        "data": response,
        "meta": { "request_id": request_id }
    })))
}

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Queue {
        request_id: Uuid,
        error: QueueError<FetchError>,
    },
}

/// Map a terminal queue failure to the status this API reports.
///
/// Upstream 4xx answers pass through so callers can tell "not found" from
/// "forbidden"; everything transient that ran out of retries becomes a 5xx.
fn status_for(error: &QueueError<FetchError>) -> StatusCode {
    match error.cause() {
        None => StatusCode::INTERNAL_SERVER_ERROR,
        Some(FetchError::Client { status, .. }) => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_REQUEST)
        }
        Some(FetchError::RateLimited { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        Some(FetchError::Transport { source, .. }) if source.is_timeout() => {
            StatusCode::GATEWAY_TIMEOUT
        }
        Some(FetchError::Transport { .. })
        | Some(FetchError::Upstream { .. })
        | Some(FetchError::UnexpectedStatus { .. }) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": { "message": message } })),
            )
                .into_response(),
            ApiError::Queue { request_id, error } => {
                let status = status_for(&error);
                let body = json!({
                    "error": {
                        "message": error.to_string(),
                        "attempts": error.attempts(),
                        "upstream_status": error.cause().and_then(FetchError::status),
                    },
                    "meta": { "request_id": request_id }
                });
                (status, Json(body)).into_response()
            }
        }
    }
}
