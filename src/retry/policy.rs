use std::sync::Arc;
use std::time::Duration;

use crate::error::{HandlerError, PolicyError};

// ============================================================================
// Exponential Backoff Retry Policy
// ============================================================================
//
// Immutable description of how hard a handler is retried:
// - attempt budget
// - backoff shape (initial delay, multiplier, cap)
// - which errors are worth another attempt
//
// One policy is shared by many retry chains; cloning only bumps the
// predicate's reference count.
//
// ============================================================================

type RetryPredicate = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryPolicy {
    /// Total invocations allowed, first attempt included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
    retry_predicate: RetryPredicate,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("retry_predicate", &"<predicate>")
            .finish()
    }
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s doubling up to 60s, retries everything not marked
    /// non-retryable
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            retry_predicate: Arc::new(HandlerError::is_retryable),
        }
    }
}

impl RetryPolicy {
    /// Validated constructor. Uses the default predicate (retry unless the
    /// error is non-retryable).
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, PolicyError> {
        if max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts);
        }
        if max_delay < initial_delay {
            return Err(PolicyError::DelayRange {
                initial_delay,
                max_delay,
            });
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(backoff_multiplier));
        }

        Ok(Self {
            max_attempts,
            initial_delay,
            max_delay,
            backoff_multiplier,
            retry_predicate: Arc::new(HandlerError::is_retryable),
        })
    }

    /// Policy for cheap, idempotent handlers (more attempts, short delays)
    pub fn fast() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            retry_predicate: Arc::new(|_: &HandlerError| true),
        }
    }

    /// Single attempt; failures go straight to the dead-letter sink
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            retry_predicate: Arc::new(|_: &HandlerError| false),
        }
    }

    pub fn with_retry_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        self.retry_predicate = Arc::new(predicate);
        self
    }

    pub fn should_retry(&self, error: &HandlerError) -> bool {
        (self.retry_predicate)(error)
    }

    /// Whether a chain that just failed its `attempt`-th invocation with
    /// `error` gets another attempt
    pub fn is_retryable(&self, error: &HandlerError, attempt: u32) -> bool {
        attempt < self.max_attempts && self.should_retry(error)
    }

    /// Delay after the `attempt`-th failure (1-indexed):
    /// `initial` for the first, then `min(max, initial * multiplier^(attempt-1))`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);

        if !nanos.is_finite() || nanos >= self.max_delay.as_nanos() as f64 {
            return self.max_delay;
        }

        Duration::from_nanos(nanos.round() as u64).min(self.max_delay)
    }
}
