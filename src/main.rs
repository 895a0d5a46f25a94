use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use fetchgate::config::{AppConfig, LoggingConfig};
use fetchgate::fetch::{self, FetchTarget, HttpAttempt};
use fetchgate::queue::{Priority, RequestQueue};

#[derive(Parser)]
#[command(
    name = "fetchgate",
    about = "Bounded, priority-aware request queue with retry and exponential backoff",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (defaults: $FETCHGATE_CONFIG, /etc/fetchgate/fetchgate.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (request queue + status / submit API)
    Serve {
        /// Bind address (overrides [api].bind)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Fetch one or more URLs through the queue
    Fetch {
        /// URLs to fetch
        #[arg(required = true)]
        urls: Vec<String>,

        /// Submit with high priority
        #[arg(long)]
        high: bool,

        /// Treat HTML responses as throttling and retry them
        #[arg(long)]
        expect_json: bool,

        /// Retries per request (overrides [queue].max_retries)
        #[arg(long)]
        max_retries: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Subscriber used only while the config file is being resolved, so that
/// fallback warnings reach stderr before `[logging]` is known.
fn bootstrap_subscriber() -> impl tracing::Subscriber + Send + Sync + 'static {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish()
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = tracing::subscriber::with_default(bootstrap_subscriber(), || {
        AppConfig::resolve(cli.config.as_deref())
    })?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting fetchgate daemon");
            fetchgate::serve(config).await?;
        }
        Commands::Fetch {
            urls,
            high,
            expect_json,
            max_retries,
            json,
        } => {
            run_fetch(&config, urls, high, expect_json, max_retries, json).await?;
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

async fn run_fetch(
    config: &AppConfig,
    urls: Vec<String>,
    high: bool,
    expect_json: bool,
    max_retries: Option<u32>,
    json: bool,
) -> Result<()> {
    let queue = RequestQueue::new(&config.queue).context("invalid queue configuration")?;
    let client = fetch::build_client(&config.http).context("failed to build HTTP client")?;
    let priority = if high { Priority::High } else { Priority::Low };
    let retries = max_retries.unwrap_or(config.queue.max_retries);

    let outcomes: Vec<_> = urls
        .iter()
        .map(|url| {
            let target = FetchTarget::get(url.clone()).expect_json(expect_json);
            queue.submit_with_retries(HttpAttempt::new(client.clone(), target), priority, retries)
        })
        .collect();
    tracing::info!(requests = outcomes.len(), %priority, "Submitted fetches");

    let results = futures::future::join_all(outcomes).await;
    let failed = results.iter().filter(|r| r.is_err()).count();

    if json {
        let rows: Vec<serde_json::Value> = urls
            .iter()
            .zip(&results)
            .map(|(url, result)| match result {
                Ok(resp) => serde_json::json!({
                    "url": url,
                    "ok": true,
                    "status": resp.status,
                    "content_type": resp.content_type,
                    "bytes": resp.body.len(),
                }),
                Err(e) => serde_json::json!({
                    "url": url,
                    "ok": false,
                    "error": e.to_string(),
                    "attempts": e.attempts(),
                }),
            })
            .collect();
        let report = serde_json::json!({ "results": rows, "stats": queue.stats() });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{:<50} | {:<6} | Details", "URL", "Status");
        println!("{:-<50}-|-{:-<6}-|-{:-<30}", "", "", "");
        for (url, result) in urls.iter().zip(&results) {
            match result {
                Ok(resp) => println!(
                    "{:<50} | {:<6} | {} bytes ({})",
                    url,
                    resp.status,
                    resp.body.len(),
                    resp.content_type.as_deref().unwrap_or("unknown type")
                ),
                Err(e) => println!("{:<50} | {:<6} | {}", url, "FAIL", e),
            }
        }
        println!();
    }

    if failed > 0 {
        anyhow::bail!("{} of {} requests failed", failed, urls.len());
    }
    Ok(())
}
