//! Retry state machine shared by the request queue and the direct fetch helper.
//!
//! A request moves ATTEMPTING -> SUCCESS | RETRY_SCHEDULED | FAILED.  A
//! scheduled retry sleeps for the policy's backoff and goes back to
//! ATTEMPTING.  SUCCESS and FAILED are terminal.

pub mod policy;

use std::fmt;

use thiserror::Error;
use tracing::{debug, warn};

pub use self::policy::RetryPolicy;

/// How a single failed attempt should be treated.
#[derive(Debug)]
pub enum Failure<E> {
    /// Transient failure: network error, timeout, throttling, upstream 5xx.
    Retryable(E),
    /// Failure that will not change on retry (e.g. a malformed request).
    Fatal(E),
}

impl<E> Failure<E> {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Failure::Retryable(_))
    }

    pub fn into_inner(self) -> E {
        match self {
            Failure::Retryable(e) | Failure::Fatal(e) => e,
        }
    }
}

/// One idempotent unit of outbound work.
///
/// The queue treats implementors as opaque: it only calls [`Attempt::attempt`]
/// as many times as the retry policy allows.
#[async_trait::async_trait]
pub trait Attempt: Send + Sync {
    type Output: Send;
    type Error: Send;

    /// Perform the call once and classify the result.
    async fn attempt(&self) -> Result<Self::Output, Failure<Self::Error>>;
}

/// Terminal failure of a request, carrying the last underlying error.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    #[error("non-retryable failure on attempt {attempts}: {source}")]
    Rejected { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    /// Total number of times the attempt was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Rejected { attempts, .. } => {
                *attempts
            }
        }
    }

    /// The most recent underlying error.
    pub fn cause(&self) -> &E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Rejected { source, .. } => source,
        }
    }

    pub fn into_cause(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } | RetryError::Rejected { source, .. } => source,
        }
    }
}

/// Drive `attempt` until it succeeds, fails fatally, or runs out of retries.
///
/// The delay between attempt `n` and `n + 1` (0-based) is
/// [`RetryPolicy::delay_for`]`(n)`.
pub async fn execute_with_retry<A>(
    attempt: &A,
    policy: &RetryPolicy,
) -> Result<A::Output, RetryError<A::Error>>
where
    A: Attempt + ?Sized,
    A::Error: fmt::Display,
{
    let mut retries: u32 = 0;

    loop {
        match attempt.attempt().await {
            Ok(output) => {
                if retries > 0 {
                    debug!(retries, "attempt succeeded after retrying");
                }
                return Ok(output);
            }
            Err(Failure::Fatal(source)) => {
                debug!(attempt = retries + 1, error = %source, "non-retryable failure");
                return Err(RetryError::Rejected {
                    attempts: retries + 1,
                    source,
                });
            }
            Err(Failure::Retryable(source)) => {
                if retries >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: retries + 1,
                        source,
                    });
                }

                let delay = policy.delay_for(retries);
                retries += 1;
                warn!(
                    retry = retries,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %source,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Fails with the scripted failures in order, then succeeds.
    struct Scripted {
        calls: AtomicU32,
        fail_first: u32,
        fatal: bool,
    }

    #[async_trait::async_trait]
    impl Attempt for Scripted {
        type Output = u32;
        type Error = String;

        async fn attempt(&self) -> Result<u32, Failure<String>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                let msg = format!("failure #{n}");
                if self.fatal {
                    return Err(Failure::Fatal(msg));
                }
                return Err(Failure::Retryable(msg));
            }
            Ok(n)
        }
    }

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let a = Scripted {
            calls: AtomicU32::new(0),
            fail_first: 2,
            fatal: false,
        };
        let started = tokio::time::Instant::now();
        let out = execute_with_retry(&a, &policy(3)).await.unwrap();
        assert_eq!(out, 3);
        // 100ms + 200ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_last_error() {
        let a = Scripted {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            fatal: false,
        };
        let err = execute_with_retry(&a, &policy(2)).await.unwrap_err();
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.cause(), "failure #3");
        assert_eq!(a.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_short_circuits_without_delay() {
        let a = Scripted {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            fatal: true,
        };
        let started = tokio::time::Instant::now();
        let err = execute_with_retry(&a, &policy(5)).await.unwrap_err();
        assert!(matches!(err, RetryError::Rejected { attempts: 1, .. }));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_retries_means_single_attempt() {
        let a = Scripted {
            calls: AtomicU32::new(0),
            fail_first: 1,
            fatal: false,
        };
        let err = execute_with_retry(&a, &policy(0)).await.unwrap_err();
        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_cause(), "failure #1");
    }

    #[test]
    fn test_failure_accessors() {
        let f: Failure<&str> = Failure::Retryable("timeout");
        assert!(f.is_retryable());
        assert_eq!(f.into_inner(), "timeout");
        assert!(!Failure::Fatal(()).is_retryable());
    }
}
