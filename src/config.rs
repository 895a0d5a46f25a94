//! TOML configuration for fetchgate.
//!
//! Layered the usual way: an explicit path, then the `FETCHGATE_CONFIG`
//! environment variable, then `/etc/fetchgate/fetchgate.toml`, then
//! compiled-in defaults.  Every section is optional.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;

/// Environment variable naming a config file to load.
pub const CONFIG_ENV: &str = "FETCHGATE_CONFIG";

const SYSTEM_CONFIG_PATH: &str = "/etc/fetchgate/fetchgate.toml";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_concurrent must be at least 1")]
    ZeroConcurrency,

    #[error("backoff_multiplier must be a finite number >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("initial_delay_ms ({initial}) exceeds max_delay_ms ({max})")]
    DelayOrder { initial: u64, max: u64 },
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the fetchgate process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .queue
            .validate()
            .with_context(|| format!("invalid [queue] section in {}", path.display()))?;
        info!(path = %path.display(), "loaded fetchgate configuration");
        Ok(config)
    }

    /// Resolve configuration for the CLI.
    ///
    /// An explicit path must load; the environment and system locations fall
    /// back to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    /// Try `FETCHGATE_CONFIG`, then the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FETCHGATE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Render the effective configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Admission and retry tunables for the request queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Hard cap on simultaneous in-flight requests.
    pub max_concurrent: usize,
    /// Attempts allowed beyond the first.
    pub max_retries: u32,
    /// Base backoff before the first retry (milliseconds).
    pub initial_delay_ms: u64,
    /// Backoff ceiling (milliseconds).
    pub max_delay_ms: u64,
    /// Exponential growth factor per retry.
    pub backoff_multiplier: f64,
    /// Pause after each low-priority request finishes before its slot is
    /// handed to the next waiter (milliseconds, 0 disables).
    pub low_priority_spacing_ms: u64,
    /// Number of terminal failures kept for inspection.
    pub failure_history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
            low_priority_spacing_ms: 0,
            failure_history_limit: 100,
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.backoff_multiplier));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::DelayOrder {
                initial: self.initial_delay_ms,
                max: self.max_delay_ms,
            });
        }
        Ok(())
    }

    /// The default retry policy for requests submitted without an override.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
        }
    }

    pub fn low_priority_spacing(&self) -> Duration {
        Duration::from_millis(self.low_priority_spacing_ms)
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// Outbound HTTP client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-attempt request timeout (seconds).
    pub timeout_secs: u64,
    /// `User-Agent` header sent with every request.
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            user_agent: concat!("fetchgate/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the status / submit API listens on.
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
