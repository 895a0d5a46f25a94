//! fetchgate -- bounded, priority-aware request queue with retry and
//! exponential backoff.
//!
//! The core is [`queue::RequestQueue`]: at most `max_concurrent` requests run
//! at once, High priority waiters are admitted before Low ones, and transient
//! failures are retried by [`retry::execute_with_retry`] before the caller's
//! [`queue::Outcome`] resolves. [`fetch`] plugs HTTP into it, [`api`] exposes
//! it over HTTP.

pub mod api;
pub mod config;
pub mod fetch;
pub mod queue;
pub mod retry;

use anyhow::{Context, Result};

use crate::config::AppConfig;

/// Start the fetchgate daemon: request queue plus the status / submit API.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Queue, constructed once and shared by handle
    let queue = queue::RequestQueue::new(&config.queue).context("invalid queue configuration")?;
    tracing::info!(
        max_concurrent = config.queue.max_concurrent,
        max_retries = config.queue.max_retries,
        worst_case_backoff_ms = queue.policy().worst_case_backoff().as_millis() as u64,
        "Request queue ready"
    );

    // 2. Outbound client
    let client = fetch::build_client(&config.http).context("failed to build HTTP client")?;

    // 3. API server
    let state = api::state::AppState { queue, client };
    let app = api::router(state);

    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    tracing::info!(%addr, "fetchgate listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
