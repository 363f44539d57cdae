//! Retry policy and backoff helpers.
//!
//! [`RetryPolicy`] decides how long a failed delivery waits before the
//! transport hands it out again and when it is routed to the dead-letter
//! topic instead. [`with_retry_if`] retries transient failures of an async
//! operation in place, and is what the publisher uses against the transport.
//!
//! # Example
//!
//! ```rust
//! use event_propagation::retry::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(
//!     3,
//!     Backoff::Exponential {
//!         base: Duration::from_millis(100),
//!         cap: Duration::from_secs(1),
//!     },
//! );
//!
//! assert_eq!(policy.next_delay(1), Duration::from_millis(100));
//! assert_eq!(policy.next_delay(2), Duration::from_millis(200));
//! assert!(policy.should_dead_letter(3));
//! ```

use crate::config::{BackoffKind, PropagationConfig};
use std::time::Duration;
use tokio::time::sleep;

/// Delay shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Constant delay.
    Fixed(Duration),
    /// `base * 2^(attempt - 1)`, never above `cap`.
    Exponential {
        /// Delay after the first failed attempt
        base: Duration,
        /// Upper bound
        cap: Duration,
    },
}

/// Redelivery policy for handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total handler attempts, including the first
    pub max_attempts: u32,

    /// Delay shape
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` below 1 is treated as 1.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Build the policy described by a configuration record.
    pub fn from_config(config: &PropagationConfig) -> Self {
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed(config.backoff_base()),
            BackoffKind::Exponential => Backoff::Exponential {
                base: config.backoff_base(),
                cap: config.backoff_cap(),
            },
        };
        Self::new(config.max_attempts, backoff)
    }

    /// Short delays, for tests and latency-sensitive consumers.
    pub fn fast() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(200),
            },
        )
    }

    /// Balanced default.
    pub fn standard() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(30),
            },
        )
    }

    /// A single attempt; the first failure is dead-lettered.
    pub fn no_retry() -> Self {
        Self::new(1, Backoff::Fixed(Duration::ZERO))
    }

    /// Delay before redelivering after `attempt` failed.
    ///
    /// `attempt` is 1-based; `0` is treated as `1`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                let exponent = attempt.max(1).saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exponent).min(cap)
            }
        }
    }

    /// Whether a delivery that failed on `attempt` has used up its attempts.
    pub fn should_dead_letter(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Execute a function with retries and a predicate for retryable errors.
///
/// The function is called up to `policy.max_attempts` times, sleeping
/// `policy.next_delay(attempt)` between calls. Errors rejected by
/// `is_retryable` are returned immediately.
///
/// # Example
///
/// ```rust,no_run
/// use event_propagation::error::{PropagationError, PropagationResult};
/// use event_propagation::retry::{with_retry_if, RetryPolicy};
///
/// async fn connect() -> PropagationResult<()> {
///     Err(PropagationError::TransportUnavailable("broker restarting".to_string()))
/// }
///
/// async fn example() -> PropagationResult<()> {
///     with_retry_if(&RetryPolicy::fast(), connect, PropagationError::is_retryable).await
/// }
/// ```
pub async fn with_retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut f: F,
    mut is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
    P: FnMut(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        let err = match f().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Transient failure cleared");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            tracing::debug!(attempt, error = ?err, "Permanent failure, not backing off");
            return Err(err);
        }
        if attempt >= policy.max_attempts {
            tracing::error!(attempt, error = ?err, "Retry budget spent");
            return Err(err);
        }

        let delay = policy.next_delay(attempt);
        tracing::warn!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = ?err,
            "Transient failure, backing off"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PropagationError, PropagationResult};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_exponential_delays_are_capped() {
        let policy = RetryPolicy::new(
            10,
            Backoff::Exponential {
                base: Duration::from_millis(100),
                cap: Duration::from_millis(500),
            },
        );

        assert_eq!(policy.next_delay(1), Duration::from_millis(100));
        assert_eq!(policy.next_delay(2), Duration::from_millis(200));
        assert_eq!(policy.next_delay(3), Duration::from_millis(400));
        assert_eq!(policy.next_delay(4), Duration::from_millis(500));
        assert_eq!(policy.next_delay(u32::MAX), Duration::from_millis(500));
        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
    }

    #[test]
    fn test_fixed_delay() {
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(250)));
        assert_eq!(policy.next_delay(1), Duration::from_millis(250));
        assert_eq!(policy.next_delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_dead_letter_boundary() {
        let policy = RetryPolicy::new(3, Backoff::Fixed(Duration::ZERO));
        assert!(!policy.should_dead_letter(1));
        assert!(!policy.should_dead_letter(2));
        assert!(policy.should_dead_letter(3));
        assert!(policy.should_dead_letter(4));

        assert!(RetryPolicy::no_retry().should_dead_letter(1));
        assert_eq!(RetryPolicy::new(0, Backoff::Fixed(Duration::ZERO)).max_attempts, 1);
    }

    #[test]
    fn test_from_config() {
        let config = PropagationConfig {
            max_attempts: 5,
            backoff: BackoffKind::Fixed,
            backoff_base_ms: 40,
            ..Default::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff, Backoff::Fixed(Duration::from_millis(40)));
    }

    fn outage() -> PropagationError {
        PropagationError::TransportUnavailable("connection refused".to_string())
    }

    #[tokio::test]
    async fn test_transient_outage_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));

        let result = with_retry_if(
            &RetryPolicy::new(5, Backoff::Fixed(Duration::from_millis(1))),
            || {
                let calls = calls.clone();
                async move {
                    match calls.fetch_add(1, Ordering::SeqCst) {
                        0 | 1 => Err(outage()),
                        n => Ok(n),
                    }
                }
            },
            PropagationError::is_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_topic_is_returned_at_once() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: PropagationResult<()> = with_retry_if(
            &RetryPolicy::fast(),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(PropagationError::TopicNotFound("payment-events".to_string())) }
            },
            PropagationError::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(PropagationError::TopicNotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_outage_outlasting_the_policy() {
        let calls = Arc::new(AtomicU32::new(0));

        let result: PropagationResult<()> = with_retry_if(
            &RetryPolicy::new(2, Backoff::Fixed(Duration::from_millis(1))),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(outage()) }
            },
            PropagationError::is_retryable,
        )
        .await;

        assert!(matches!(result, Err(PropagationError::TransportUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
