//! Bounded retry primitives for coordination-service calls.
//!
//! Two shapes are used by the cluster layer:
//! - [`RetryPolicy`]: exponential backoff around a single store operation,
//!   retrying only transient failures.
//! - [`FixedBackoff`]: a fixed-interval attempt budget for application-level
//!   loops (counter compare-and-set, readiness polling).

use std::{future::Future, time::Duration};

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{error, warn};

use crate::{config::RetryConfig, error::CoordinationError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Doubling backoff from `base_delay` capped at `max_delay`. The attempt
    /// budget is enforced by [`RetryPolicy::run`], not by elapsed time.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base_delay)
            .with_max_interval(self.max_delay)
            .with_multiplier(2.0)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `op`, retrying transient failures up to `max_retries` times.
    /// Non-transient failures are returned immediately.
    pub async fn run<F, Fut, T>(&self, what: &str, mut op: F) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoordinationError>>,
    {
        let max_retries = self.max_retries;
        let mut attempts = 0u32;
        backoff::future::retry_notify(
            self.backoff(),
            || {
                attempts += 1;
                let attempt = attempts;
                let fut = op();
                async move {
                    fut.await.map_err(|e| {
                        if !e.is_transient() {
                            backoff::Error::permanent(e)
                        } else if attempt <= max_retries {
                            backoff::Error::transient(e)
                        } else {
                            error!("{} failed after {} retries: {}", what, attempt - 1, e);
                            backoff::Error::permanent(e)
                        }
                    })
                }
            },
            |e: CoordinationError, delay: Duration| {
                warn!("{} failed: {}. Retrying in {:?}", what, e, delay);
            },
        )
        .await
    }
}

/// Fixed-interval attempt budget. `None` as the limit means poll forever.
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    interval: Duration,
    max_attempts: Option<u32>,
    attempts: u32,
}

impl FixedBackoff {
    pub fn bounded(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
            attempts: 0,
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
            attempts: 0,
        }
    }

    /// Attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record an attempt. Returns `false` once the budget is spent, otherwise
    /// sleeps for the interval and returns `true`.
    pub async fn next_attempt(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        if let Some(max) = self.max_attempts {
            if self.attempts >= max {
                return false;
            }
        }
        tokio::time::sleep(self.interval).await;
        true
    }
}
