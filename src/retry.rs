//! Budget-aware retry with adaptive per-attempt timeouts.
//!
//! Classic retry loops own a fixed attempt count and a fixed timeout. Here
//! the controlling resource is a shared wall-clock budget instead: each
//! attempt is granted a shrinking slice of whatever budget remains, backoff
//! delays are capped so waiting never starves the next attempt, and the loop
//! stops the moment the remaining budget cannot fund a viable attempt.
//!
//! The controller never wraps the operation in its own timer. The operation
//! receives its granted timeout as an argument and is responsible for
//! honouring it (adapters via `RequestBuilder::timeout`, transfers via their
//! deadline), so timeout accounting lives in exactly one place per layer.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

use crate::config::AcquireConfig;
use crate::error::{classify, AcquireError, FailureClass};

/// Budget-aware retry controller.
///
/// Stateless across calls; every [`attempt`](RetryBudget::attempt) invocation
/// tracks its own budget clock, so one controller is shared by provider
/// fetches and transfers alike.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    min_attempt: Duration,
    max_attempt: Duration,
    attempt_fraction: f64,
    network_backoff_base: Duration,
    stall_backoff_base: Duration,
    max_jitter: Duration,
    max_delay_fraction: f64,
}

impl RetryBudget {
    /// Builds a controller from pipeline configuration.
    #[must_use]
    pub fn from_config(config: &AcquireConfig) -> Self {
        Self {
            min_attempt: config.min_attempt(),
            max_attempt: config.max_attempt(),
            attempt_fraction: config.attempt_fraction,
            network_backoff_base: Duration::from_millis(config.network_backoff_base_ms),
            stall_backoff_base: Duration::from_millis(config.stall_backoff_base_ms),
            max_jitter: Duration::from_millis(config.max_jitter_ms),
            max_delay_fraction: config.max_delay_fraction,
        }
    }

    /// Runs `op` repeatedly until success, a fatal error, or budget
    /// exhaustion.
    ///
    /// Each call receives the timeout granted to that attempt. The first
    /// attempt gets `attempt_fraction` of the budget; later attempts get
    /// progressively smaller fractions of whatever remains, always clamped
    /// to the configured floor and ceiling.
    ///
    /// # Errors
    ///
    /// Returns the operation's error unchanged when it is not retryable,
    /// and [`AcquireError::BudgetExceeded`] when the remaining budget can no
    /// longer fund a viable attempt.
    pub async fn attempt<T, F, Fut>(
        &self,
        budget: Duration,
        mut op: F,
    ) -> Result<T, AcquireError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = Result<T, AcquireError>>,
    {
        let started = Instant::now();
        let mut attempt: u32 = 1;

        loop {
            let remaining = budget.saturating_sub(started.elapsed());
            if remaining < self.min_attempt {
                debug!(
                    attempt,
                    remaining_ms = remaining.as_millis() as u64,
                    "remaining budget below viable attempt floor"
                );
                return Err(AcquireError::budget_exceeded(budget, started.elapsed()));
            }

            let timeout = self.attempt_timeout(remaining, attempt);
            debug!(
                attempt,
                timeout_ms = timeout.as_millis() as u64,
                remaining_ms = remaining.as_millis() as u64,
                "granting attempt timeout"
            );

            let error = match op(timeout).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let class = classify(&error);
            if !class.is_retryable() {
                debug!(attempt, error = %error, "error is not retryable");
                return Err(error);
            }

            let remaining = budget.saturating_sub(started.elapsed());
            let Some(delay) = self.backoff_delay(class, attempt, error.retry_after(), remaining)
            else {
                warn!(
                    attempt,
                    error = %error,
                    remaining_ms = remaining.as_millis() as u64,
                    "no budget left for another attempt"
                );
                return Err(AcquireError::budget_exceeded(budget, started.elapsed()));
            };

            warn!(
                attempt,
                error = %error,
                delay_ms = delay.as_millis() as u64,
                "attempt failed, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// The timeout granted to one attempt.
    ///
    /// A shrinking fraction of the remaining budget, clamped to the
    /// configured floor and ceiling and never exceeding what is left.
    fn attempt_timeout(&self, remaining: Duration, attempt: u32) -> Duration {
        let fraction = self.attempt_fraction / (1.0 + 0.5 * f64::from(attempt.saturating_sub(1)));
        let granted = remaining.mul_f64(fraction);
        granted
            .max(self.min_attempt)
            .min(self.max_attempt)
            .min(remaining)
    }

    /// The backoff delay before the next attempt, or `None` when waiting
    /// would leave no room for a viable attempt afterwards.
    fn backoff_delay(
        &self,
        class: FailureClass,
        attempt: u32,
        retry_after: Option<Duration>,
        remaining: Duration,
    ) -> Option<Duration> {
        if remaining <= self.min_attempt {
            return None;
        }

        let base = match class {
            // Stalls already cost a full timeout, so they back off harder.
            FailureClass::Stall => self.stall_backoff_base,
            FailureClass::Network => self.network_backoff_base,
            FailureClass::Fatal => return None,
        };

        let exponent = attempt.saturating_sub(1).min(16);
        let jitter_ms = rand::thread_rng().gen_range(0..=self.max_jitter.as_millis() as u64);
        let computed = base * 2_u32.saturating_pow(exponent) + Duration::from_millis(jitter_ms);

        // Waiting never eats more than a fraction of what is left.
        let cap = remaining.mul_f64(self.max_delay_fraction);
        let mut delay = computed.min(cap);

        // A server-mandated delay is a floor, not a suggestion. When even the
        // mandated delay leaves no room for an attempt, give up now.
        if let Some(mandated) = retry_after {
            if mandated + self.min_attempt > remaining {
                return None;
            }
            delay = delay.max(mandated);
        }

        Some(delay)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn controller() -> RetryBudget {
        RetryBudget {
            min_attempt: Duration::from_millis(10),
            max_attempt: Duration::from_millis(500),
            attempt_fraction: 0.5,
            network_backoff_base: Duration::from_millis(5),
            stall_backoff_base: Duration::from_millis(20),
            max_jitter: Duration::from_millis(2),
            max_delay_fraction: 0.25,
        }
    }

    #[tokio::test]
    async fn test_attempt_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result = controller()
            .attempt(Duration::from_secs(1), |_timeout| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, AcquireError>(42) }
            })
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_retries_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = controller()
            .attempt(Duration::from_secs(2), |_timeout| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 2 {
                        Err(AcquireError::provider_unavailable("piped", "flaky"))
                    } else {
                        Ok("recovered")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_stops_on_fatal_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = controller()
            .attempt(Duration::from_secs(2), |_timeout| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AcquireError::no_formats("piped")) }
            })
            .await;

        assert!(matches!(result, Err(AcquireError::NoFormatsAvailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_exhausts_budget() {
        let result: Result<(), _> = controller()
            .attempt(Duration::from_millis(60), |timeout| async move {
                tokio::time::sleep(timeout).await;
                Err(AcquireError::provider_unavailable("piped", "down"))
            })
            .await;

        assert!(matches!(result, Err(AcquireError::BudgetExceeded { .. })));
    }

    #[tokio::test]
    async fn test_attempt_zero_budget_fails_without_calling_op() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = controller()
            .attempt(Duration::ZERO, |_timeout| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(AcquireError::BudgetExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_attempt_gives_up_when_retry_after_exceeds_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = controller()
            .attempt(Duration::from_millis(200), |_timeout| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AcquireError::provider_unavailable_with_retry_after(
                        "piped",
                        "rate limited",
                        Some(Duration::from_secs(30)),
                    ))
                }
            })
            .await;

        // One attempt, then the mandated delay makes another impossible.
        assert!(matches!(result, Err(AcquireError::BudgetExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_attempt_timeout_shrinks_across_attempts() {
        let controller = controller();
        let remaining = Duration::from_millis(400);
        let first = controller.attempt_timeout(remaining, 1);
        let second = controller.attempt_timeout(remaining, 2);
        let third = controller.attempt_timeout(remaining, 3);
        assert!(first > second);
        assert!(second > third);
        assert!(third >= controller.min_attempt);
    }

    #[test]
    fn test_attempt_timeout_clamped_to_ceiling() {
        let controller = controller();
        let granted = controller.attempt_timeout(Duration::from_secs(100), 1);
        assert_eq!(granted, controller.max_attempt);
    }

    #[test]
    fn test_backoff_delay_caps_at_remaining_fraction() {
        let controller = controller();
        let remaining = Duration::from_millis(100);
        let delay = controller
            .backoff_delay(FailureClass::Stall, 8, None, remaining)
            .unwrap();
        assert!(delay <= remaining.mul_f64(controller.max_delay_fraction));
    }

    #[test]
    fn test_backoff_delay_honours_retry_after_floor() {
        let controller = controller();
        let delay = controller
            .backoff_delay(
                FailureClass::Network,
                1,
                Some(Duration::from_millis(150)),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(delay >= Duration::from_millis(150));
    }

    #[test]
    fn test_backoff_delay_none_when_budget_spent() {
        let controller = controller();
        let delay =
            controller.backoff_delay(FailureClass::Network, 1, None, Duration::from_millis(5));
        assert!(delay.is_none());
    }
}
