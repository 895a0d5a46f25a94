//! Exponential backoff policy.

use std::time::Duration;

/// Retry limits and backoff shape for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed beyond the first.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling applied to every computed delay.
    pub max_delay: Duration,
    /// Growth factor per retry.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(5000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Same backoff shape with a different retry budget.
    pub fn with_max_retries(&self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self.clone()
        }
    }

    /// Delay to wait after the failure of attempt `retry_index` (0-based):
    /// `min(max_delay, initial_delay * backoff_multiplier ^ retry_index)`.
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let exponent = i32::try_from(retry_index).unwrap_or(i32::MAX);
        let grown = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let ceiling = self.max_delay.as_millis() as f64;

        // powi overflows to +inf long before u64 millis would; min() clamps it.
        let millis = if grown.is_nan() { ceiling } else { grown.min(ceiling) };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Worst-case total backoff a single request can accumulate.
    pub fn worst_case_backoff(&self) -> Duration {
        (0..self.max_retries).map(|n| self.delay_for(n)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_then_caps() {
        let p = RetryPolicy::default();
        let delays: Vec<u64> = (0..6).map(|n| p.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 5000, 5000]);
    }

    #[test]
    fn test_multiplier_of_one_is_constant() {
        let p = RetryPolicy {
            backoff_multiplier: 1.0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.delay_for(0), p.delay_for(7));
    }

    #[test]
    fn test_huge_retry_index_saturates_at_ceiling() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_for(u32::MAX), Duration::from_millis(5000));
    }

    #[test]
    fn test_worst_case_backoff() {
        let p = RetryPolicy::default();
        // 500 + 1000 + 2000
        assert_eq!(p.worst_case_backoff(), Duration::from_millis(3500));
        assert_eq!(p.with_max_retries(0).worst_case_backoff(), Duration::ZERO);
    }
}
