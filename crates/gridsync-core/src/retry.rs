//! Retrying idempotent tasks through transient failures
//!
//! [`run_task`] drives a [`RetryTask`] whose `try_once` may carry state
//! between attempts. It knows nothing about backlogs or handshakes.

use crate::config::DeliveryConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Attempt budget and backoff bounds
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Cap on any single delay
    pub max_delay: Duration,
    /// Fraction of the delay randomized either way
    pub jitter_factor: f64,
}

impl RetryConfig {
    /// Reconnect policy of a delivery worker
    pub fn from_delivery(config: &DeliveryConfig) -> Self {
        Self {
            max_attempts: config.reconnect_attempts,
            initial_delay: config.reconnect_initial_delay,
            max_delay: config.reconnect_max_delay,
            jitter_factor: 0.1,
        }
    }

    /// Delay after failed attempt number `attempt` (1-based)
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_nanos() as f64
            * BACKOFF_MULTIPLIER.powi(attempt.saturating_sub(1) as i32);
        let base = base.min(self.max_delay.as_nanos() as f64);

        let jitter = (rand::random::<f64>() - 0.5) * 2.0 * base * self.jitter_factor;
        Duration::from_nanos((base + jitter).max(0.0) as u64)
    }
}

/// Unit of work retried by [`run_task`]
///
/// `try_once` must be idempotent: a failed attempt may have done part of its
/// work and will simply be attempted again.
#[async_trait]
pub trait RetryTask: Send {
    /// Value produced by a successful attempt
    type Output: Send;

    /// Make one attempt
    async fn try_once(&mut self) -> Result<Self::Output>;

    /// Called after every failed attempt
    fn on_failure(&mut self, _attempt: u32, _error: &Error) {}
}

/// Drive `task` until it succeeds, fails permanently or runs out of attempts
pub async fn run_task<T>(config: RetryConfig, task: &mut T) -> Result<T::Output>
where
    T: RetryTask + ?Sized,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match task.try_once().await {
            Ok(output) => {
                if attempt > 1 {
                    tracing::debug!("Task succeeded on attempt {}", attempt);
                }
                return Ok(output);
            }
            Err(error) => {
                task.on_failure(attempt, &error);
                if !error.is_retryable() || attempt >= config.max_attempts {
                    return Err(error);
                }
                sleep(config.delay(attempt)).await;
            }
        }
    }
}
