//! Retry for operations racing eventual consistency.
//!
//! A freshly created identity can take seconds to become visible to the
//! policy and key subsystems. Calls against it fail with a "does not exist"
//! signature that is classified as [`Error::PropagationDelay`]; only that
//! signature is retried. Any other failure is surfaced on the spot.
//!
//! # Example
//!
//! ```ignore
//! use groundwork::retry::RetryPolicy;
//!
//! let key = RetryPolicy::with_max_attempts(3)
//!     .execute("create_key", || async { identities.create_key(&email).await })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::{Error, Result};

/// Default unit the backoff is measured in
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_secs(1);

/// Bounded exponential backoff on propagation delay.
///
/// The delay before attempt `k` (0-indexed, so `k >= 1` for retries) is
/// `unit * 2^k`: with the default unit, 2s before the second attempt and 4s
/// before the third.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first; 0 is treated as 1
    pub max_attempts: u32,
    /// Base time unit for the backoff
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            unit: DEFAULT_BACKOFF_UNIT,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with an explicit unit
    pub fn new(max_attempts: u32, unit: Duration) -> Self {
        Self { max_attempts, unit }
    }

    /// Create a policy with the default unit
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// Delay inserted before the given 0-indexed attempt.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor)
    }

    /// Run `operation`, retrying only on [`Error::PropagationDelay`].
    ///
    /// Returns the last propagation error once attempts run out. Any other
    /// error is returned immediately without using up remaining attempts.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_propagation_delay() => {
                    error!(
                        operation = %operation_name,
                        attempt = attempt + 1,
                        error = %e,
                        "Operation failed with a non-retryable error"
                    );
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        error!(
                            operation = %operation_name,
                            attempt,
                            error = %e,
                            "Operation still not propagated after max attempts"
                        );
                        return Err(e);
                    }

                    warn!(
                        operation = %operation_name,
                        attempt,
                        max_attempts,
                        error = %e,
                        delay_ms = self.delay_before(attempt).as_millis() as u64,
                        "Resource not yet propagated, retrying"
                    );
                }
            }
        }
    }
}

/// Error used in tests and fakes for the "not yet visible" signature.
#[cfg(test)]
pub(crate) fn not_propagated(name: &str) -> Error {
    Error::propagation_delay(name, "does not exist")
}
