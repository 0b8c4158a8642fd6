/*!
 * Utility functions and helpers for withub.
 *
 * This module provides the retry policy shared by every operation that may be
 * attempted more than once, plus a timeout helper.
 */
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Run a future with a timeout
///
/// # Arguments
///
/// * `duration` - The timeout duration
/// * `future` - The future to run
///
/// # Returns
///
/// The result of the future, or a timeout error if the timeout is reached
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "Operation timed out after {:?}",
            duration
        ))),
    }
}

/// How often an operation is attempted and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, `None` for no limit
    pub max_attempts: Option<u32>,
    /// Delay between two consecutive attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retry
    pub const fn once() -> Self {
        Self {
            max_attempts: Some(1),
            backoff: Duration::ZERO,
        }
    }

    /// Retry without limit at a fixed cadence
    pub const fn forever(backoff: Duration) -> Self {
        Self {
            max_attempts: None,
            backoff,
        }
    }

    /// At most `max_attempts` attempts at a fixed cadence
    pub const fn limited(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            backoff,
        }
    }

    /// Whether the 1-based `attempt` may run under this policy
    pub fn allows(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max.max(1),
            None => true,
        }
    }

    /// Run `op` until it succeeds or the policy is exhausted
    ///
    /// `op` receives the 1-based attempt number. The error of the last
    /// attempt is returned when every attempt failed. Dropping the returned
    /// future cancels the loop between or during attempts.
    pub async fn run<F, Fut, T, E>(&self, name: &str, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded after {} attempts", name, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if self.allows(attempt + 1) => {
                    warn!("{} attempt {} failed: {}", name, attempt, e);
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("{} failed after {} attempts: {}", name, attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}
