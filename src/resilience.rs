//! Resilience utilities: retry policy and request timeouts.
//!
//! - [`RetryConfig`]: Exponential backoff for transient sync source failures
//! - [`with_request_timeout`]: Bound one remote call, mapping elapsed time to
//!   a retryable [`ReplicationError::Remote`]

use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::time::Duration;

/// Configuration for retry behavior against one sync source.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first failure.
    /// Set to `usize::MAX` to never give up on a source.
    pub max_attempts: usize,

    /// Initial delay before first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual request.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = (attempt - 1).min(i32::MAX as usize) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }

    /// Whether another retry is allowed after `failures` consecutive failures.
    pub fn should_retry(&self, failures: usize) -> bool {
        failures <= self.max_attempts
    }
}

/// Run one remote request with a deadline.
///
/// An elapsed deadline becomes a retryable `Remote` error tagged with the
/// host and operation so the fetcher treats it like any transport failure.
pub async fn with_request_timeout<T, F>(
    timeout: Duration,
    source_host: &str,
    operation: &str,
    request: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, request).await {
        Ok(result) => result,
        Err(_) => Err(ReplicationError::remote(
            source_host,
            operation,
            format!("timed out after {:?}", timeout),
        )),
    }
}
