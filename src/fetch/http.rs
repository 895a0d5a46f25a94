use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::{FetchError, FetchResponse, FetchTarget};
use crate::retry::{Attempt, Failure};

/// One HTTP request, repeatable as often as the retry policy allows.
#[derive(Debug, Clone)]
pub struct HttpAttempt {
    client: Client,
    target: FetchTarget,
}

impl HttpAttempt {
    pub fn new(client: Client, target: FetchTarget) -> Self {
        Self { client, target }
    }

    pub fn target(&self) -> &FetchTarget {
        &self.target
    }

    /// Connection, timeout and body errors are transient; a request that
    /// cannot even be built never will be.
    fn transport(&self, source: reqwest::Error) -> Failure<FetchError> {
        let builder = source.is_builder();
        let err = FetchError::Transport {
            url: self.target.url.clone(),
            source,
        };
        if builder {
            Failure::Fatal(err)
        } else {
            Failure::Retryable(err)
        }
    }
}

#[async_trait::async_trait]
impl Attempt for HttpAttempt {
    type Output = FetchResponse;
    type Error = FetchError;

    async fn attempt(&self) -> Result<FetchResponse, Failure<FetchError>> {
        let mut request = self
            .client
            .request(self.target.method.clone(), &self.target.url);
        for (name, value) in &self.target.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &self.target.body {
            request = request.body(body.clone());
        }

        let response = request.send().await.map_err(|e| self.transport(e))?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        debug!(url = %self.target.url, status = status.as_u16(), ?content_type, "response received");

        classify(
            &self.target.url,
            status,
            content_type.as_deref(),
            self.target.expect_json,
        )?;

        let body = response.text().await.map_err(|e| self.transport(e))?;
        Ok(FetchResponse {
            status: status.as_u16(),
            content_type,
            body,
        })
    }
}

/// Decide whether a response is usable, worth retrying, or final.
///
/// When `expect_json` is set, an HTML body on a success status is read as an
/// upstream throttling page. This is a heuristic: a service that legitimately
/// answers with HTML must be fetched with `expect_json` off.
pub fn classify(
    url: &str,
    status: StatusCode,
    content_type: Option<&str>,
    expect_json: bool,
) -> Result<(), Failure<FetchError>> {
    let url = url.to_string();
    let code = status.as_u16();

    if status.is_success() {
        let html = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("text/html"));
        if expect_json && html {
            return Err(Failure::Retryable(FetchError::RateLimited { url, status: code }));
        }
        return Ok(());
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Failure::Retryable(FetchError::RateLimited { url, status: code }));
    }
    if status.is_server_error() {
        return Err(Failure::Retryable(FetchError::Upstream { url, status: code }));
    }
    if status.is_client_error() {
        return Err(Failure::Fatal(FetchError::Client { url, status: code }));
    }
    Err(Failure::Fatal(FetchError::UnexpectedStatus { url, status: code }))
}
