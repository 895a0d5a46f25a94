//! HTTP as a retryable [`Attempt`](crate::retry::Attempt).
//!
//! [`HttpAttempt`] performs one request and classifies the response;
//! [`fetch_with_retry`] drives it through the retry state machine without
//! going through a queue.

pub mod http;

use std::time::Duration;

use reqwest::{Client, Method};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::config::HttpConfig;
use crate::retry::{execute_with_retry, RetryError, RetryPolicy};

pub use self::http::{classify, HttpAttempt};

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} is rate limiting requests (HTTP {status})")]
    RateLimited { url: String, status: u16 },

    #[error("{url} returned server error HTTP {status}")]
    Upstream { url: String, status: u16 },

    #[error("{url} rejected the request with HTTP {status}")]
    Client { url: String, status: u16 },

    #[error("{url} returned unexpected HTTP {status}")]
    UnexpectedStatus { url: String, status: u16 },
}

impl FetchError {
    /// HTTP status observed upstream, when a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            FetchError::RateLimited { status, .. }
            | FetchError::Upstream { status, .. }
            | FetchError::Client { status, .. }
            | FetchError::UnexpectedStatus { status, .. } => Some(*status),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Transport { source, .. } if source.is_timeout())
    }
}

/// What to request. Opaque to the queue; must be safe to send repeatedly.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchTarget {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    /// Treat an HTML response as a throttled upstream rather than data.
    pub expect_json: bool,
}

impl FetchTarget {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            expect_json: false,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            body: Some(body.into()),
            ..Self::get(url)
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn expect_json(mut self, expect: bool) -> Self {
        self.expect_json = expect;
        self
    }
}

/// A response that passed classification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchResponse {
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(&self.body)
    }
}

/// Build the shared outbound client from `[http]` settings.
pub fn build_client(config: &HttpConfig) -> reqwest::Result<Client> {
    Client::builder()
        .timeout(config.timeout())
        .connect_timeout(config.timeout().min(Duration::from_secs(5)))
        .user_agent(config.user_agent.clone())
        .build()
}

/// Fetch `target`, retrying transient failures with `policy`'s backoff.
pub async fn fetch_with_retry(
    client: &Client,
    target: FetchTarget,
    policy: &RetryPolicy,
) -> Result<FetchResponse, RetryError<FetchError>> {
    let url = target.url.clone();
    let attempt = HttpAttempt::new(client.clone(), target);
    let result = execute_with_retry(&attempt, policy).await;

    match &result {
        Ok(response) => info!(%url, status = response.status, "fetch succeeded"),
        Err(RetryError::Exhausted { attempts, .. }) => {
            info!(%url, attempts, "all retry attempts exhausted")
        }
        Err(RetryError::Rejected { source, .. }) => {
            info!(%url, error = %source, "non-retryable fetch failure")
        }
    }
    result
}
